//! On-disk staging of mapped records
//!
//! An in-place load may not touch the live table until every source file has parsed and
//! mapped cleanly, so mapped batches are written here first, one JSON record per line, inside
//! the run directory. The directory goes away with the snapshot.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};
use crate::models::NormalizedRecord;

/// Appends mapped records to a spool file
pub struct SpoolWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
}

impl SpoolWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| spool_error("creating", &path, e))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn append(&mut self, records: &[NormalizedRecord]) -> Result<()> {
        for record in records {
            serde_json::to_writer(&mut self.out, record)
                .map_err(|e| spool_error("writing", &self.path, e))?;
            self.out
                .write_all(b"\n")
                .map_err(|e| spool_error("writing", &self.path, e))?;
        }
        self.records += records.len() as u64;
        Ok(())
    }

    /// Flush and return how many records were staged
    pub fn finish(mut self) -> Result<u64> {
        self.out
            .flush()
            .map_err(|e| spool_error("flushing", &self.path, e))?;
        Ok(self.records)
    }
}

/// Reads a spool file back in batches
pub struct SpoolReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl SpoolReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| spool_error("opening", &path, e))?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
        })
    }

    /// Up to `size` records; empty once the spool is exhausted
    pub fn next_batch(&mut self, size: usize) -> Result<Vec<NormalizedRecord>> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            let Some(line) = self.lines.next() else {
                break;
            };
            let line = line.map_err(|e| spool_error("reading", &self.path, e))?;
            let record =
                serde_json::from_str(&line).map_err(|e| spool_error("decoding", &self.path, e))?;
            batch.push(record);
        }
        Ok(batch)
    }
}

fn spool_error(action: &str, path: &Path, err: impl std::fmt::Display) -> IngestError {
    IngestError::ExtractionFailed(format!("{} spool {}: {}", action, path.display(), err))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{AddressEntry, AddressLevel};
    use chrono::NaiveDate;

    fn record(code: i64) -> NormalizedRecord {
        NormalizedRecord::Address(AddressEntry {
            code,
            type_code: 104,
            level: AddressLevel::City,
            status: "EKS".to_string(),
            parent_code: 100000000,
            parent_type_code: 101,
            name: "Rīga".to_string(),
            sort_name: "RIGA".to_string(),
            postal_code: None,
            valid_from: NaiveDate::from_ymd_opt(1990, 1, 1),
            valid_to: None,
            updated_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            full_name: "Rīga, \"centrs\"".to_string(),
            region_code: Some("0001000".to_string()),
        })
    }

    #[test]
    fn test_spool_reads_back_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AW_PILSETA.CSV.spool");

        let mut writer = SpoolWriter::create(&path).unwrap();
        writer.append(&[record(1), record(2)]).unwrap();
        writer.append(&[]).unwrap();
        writer.append(&[record(3), record(4), record(5)]).unwrap();
        assert_eq!(writer.finish().unwrap(), 5);

        let mut reader = SpoolReader::open(&path).unwrap();
        let mut sizes = Vec::new();
        let mut codes = Vec::new();
        loop {
            let batch = reader.next_batch(3).unwrap();
            if batch.is_empty() {
                break;
            }
            sizes.push(batch.len());
            codes.extend(batch.iter().map(NormalizedRecord::external_code));
        }
        assert_eq!(sizes, vec![3, 2]);
        assert_eq!(codes, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_empty_spool_yields_no_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.spool");
        assert_eq!(SpoolWriter::create(&path).unwrap().finish().unwrap(), 0);
        assert!(SpoolReader::open(&path).unwrap().next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_spool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.spool");
        std::fs::write(&path, "{not json}\n").unwrap();
        let err = SpoolReader::open(&path).unwrap().next_batch(10).unwrap_err();
        assert!(matches!(err, IngestError::ExtractionFailed(_)));
    }
}
