//! Snapshot retrieval and unpacking
//!
//! [`ArchiveFetcher::fetch`] downloads a payload in one request with no retry.
//! [`ArchiveFetcher::unpack`] turns it into a directory of source files: ZIP payloads are
//! extracted, anything else is written as the register's single source file. Every run gets
//! its own uniquely named directory under the work dir.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::catalog::{RegisterKind, SchemaCatalog};
use crate::error::{IngestError, Result};

/// Local file header signature that starts every ZIP archive
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

const USER_AGENT: &str = concat!("refload/", env!("CARGO_PKG_VERSION"));

/// Whether a payload looks like a ZIP archive
pub fn is_zip(payload: &[u8]) -> bool {
    payload.starts_with(ZIP_MAGIC)
}

/// Downloads snapshots and unpacks them into per-run directories
#[derive(Debug, Clone)]
pub struct ArchiveFetcher {
    client: Client,
    work_dir: PathBuf,
}

impl ArchiveFetcher {
    pub fn new(connect_timeout: Duration, timeout: Duration, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| IngestError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            work_dir: work_dir.into(),
        })
    }

    /// GET the payload. Non-2xx responses and transport errors are `DownloadFailed`; an empty
    /// body is returned as-is for the change gate to classify.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url, "Downloading snapshot");

        let failed = |reason: String| IngestError::DownloadFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(describe_request_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| failed(describe_request_error(&e)))?;

        info!(url, bytes = body.len(), "Snapshot downloaded");
        Ok(body.to_vec())
    }

    /// Unpack a payload into a fresh directory
    pub async fn unpack(&self, register: RegisterKind, payload: Vec<u8>) -> Result<Snapshot> {
        let work_dir = self.work_dir.clone();
        tokio::task::spawn_blocking(move || {
            if is_zip(&payload) {
                extract(&payload, &work_dir, register)
            } else {
                write_single_file(&payload, &work_dir, register)
            }
        })
        .await
        .map_err(|e| IngestError::ExtractionFailed(format!("extraction task failed: {}", e)))?
    }
}

fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}

fn run_dir(work_dir: &Path, register: RegisterKind) -> Result<TempDir> {
    std::fs::create_dir_all(work_dir).map_err(|e| {
        IngestError::ExtractionFailed(format!("creating {}: {}", work_dir.display(), e))
    })?;

    tempfile::Builder::new()
        .prefix(&format!("refload-{}-", register))
        .tempdir_in(work_dir)
        .map_err(|e| IngestError::ExtractionFailed(format!("creating run directory: {}", e)))
}

/// Extract every file entry of a ZIP payload, flattened to its base name. Two entries with
/// the same base name (ignoring case) fail the extraction rather than overwrite each other.
///
/// The payload is staged in a temporary archive file next to the run directory; it is
/// removed when this returns, on success or failure.
pub fn extract(payload: &[u8], work_dir: &Path, register: RegisterKind) -> Result<Snapshot> {
    let dir = run_dir(work_dir, register)?;

    let mut archive_file = tempfile::Builder::new()
        .prefix("refload-archive-")
        .suffix(".zip")
        .tempfile_in(work_dir)
        .map_err(|e| IngestError::ExtractionFailed(format!("staging archive: {}", e)))?;
    archive_file
        .write_all(payload)
        .and_then(|_| archive_file.flush())
        .map_err(|e| IngestError::ExtractionFailed(format!("staging archive: {}", e)))?;

    let mut archive = zip::ZipArchive::new(archive_file.reopen().map_err(|e| {
        IngestError::ExtractionFailed(format!("reopening staged archive: {}", e))
    })?)?;

    let mut files = Vec::with_capacity(archive.len());
    let mut seen = HashSet::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let Some(name) = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };

        if !seen.insert(name.to_ascii_uppercase()) {
            return Err(IngestError::ExtractionFailed(format!(
                "archive holds more than one entry named {}",
                name
            )));
        }

        let target = dir.path().join(&name);
        let mut out = File::create(&target).map_err(|e| {
            IngestError::ExtractionFailed(format!("creating {}: {}", target.display(), e))
        })?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| IngestError::ExtractionFailed(format!("extracting {}: {}", name, e)))?;

        files.push(target);
    }

    info!(
        register = %register,
        path = %dir.path().display(),
        files = files.len(),
        "Archive extracted"
    );
    Ok(Snapshot { dir, files })
}

fn write_single_file(payload: &[u8], work_dir: &Path, register: RegisterKind) -> Result<Snapshot> {
    let entries = SchemaCatalog::entries(register);
    let [entry] = entries else {
        return Err(IngestError::ExtractionFailed(format!(
            "{} snapshot is not a ZIP archive but the register has {} source files",
            register,
            entries.len()
        )));
    };

    let dir = run_dir(work_dir, register)?;
    let target = dir.path().join(entry.file_name);
    std::fs::write(&target, payload).map_err(|e| {
        IngestError::ExtractionFailed(format!("writing {}: {}", target.display(), e))
    })?;

    debug!(register = %register, path = %target.display(), "Plain payload stored");
    Ok(Snapshot {
        dir,
        files: vec![target],
    })
}

/// Unpacked source files of one run
#[derive(Debug)]
pub struct Snapshot {
    dir: TempDir,
    files: Vec<PathBuf>,
}

impl Snapshot {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Locate a source file by name, ignoring ASCII case
    pub fn find(&self, file_name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(file_name))
            })
            .map(PathBuf::as_path)
    }

    /// Delete the run directory, logging its path first
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        info!(path = %path.display(), "Removing extraction directory");
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove extraction directory");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, body) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn fetcher(work_dir: &Path) -> ArchiveFetcher {
        ArchiveFetcher::new(Duration::from_secs(5), Duration::from_secs(5), work_dir).unwrap()
    }

    #[test]
    fn test_zip_sniffing() {
        assert!(is_zip(&zip_of(&[("a.csv", "x")])));
        assert!(!is_zip(b"regcode;sepa;name\n"));
        assert!(!is_zip(b""));
    }

    #[test]
    fn test_extract_flattens_and_leaves_no_archive_behind() {
        let work = tempfile::tempdir().unwrap();
        let payload = zip_of(&[("aw_csv/AW_IELA.CSV", "h\n1\n"), ("AW_EKA.CSV", "h\n")]);

        let snapshot = extract(&payload, work.path(), RegisterKind::Address).unwrap();
        assert_eq!(snapshot.files().len(), 2);
        assert!(snapshot.find("aw_iela.csv").is_some());
        assert_eq!(
            std::fs::read_to_string(snapshot.find("AW_IELA.CSV").unwrap()).unwrap(),
            "h\n1\n"
        );

        // only the run directory remains in the work dir
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 1);

        let run_dir = snapshot.path().to_path_buf();
        snapshot.cleanup();
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_corrupt_zip_fails_and_cleans_up() {
        let work = tempfile::tempdir().unwrap();
        let mut payload = b"PK\x03\x04".to_vec();
        payload.extend_from_slice(&[0u8; 64]);

        let err = extract(&payload, work.path(), RegisterKind::Address).unwrap_err();
        assert!(matches!(err, IngestError::ExtractionFailed(_)));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicate_base_names_are_rejected() {
        let work = tempfile::tempdir().unwrap();
        let payload = zip_of(&[
            ("2023/AW_IELA.CSV", "h\nold\n"),
            ("2024/aw_iela.csv", "h\nnew\n"),
        ]);

        let err = extract(&payload, work.path(), RegisterKind::Address).unwrap_err();
        assert!(matches!(err, IngestError::ExtractionFailed(ref msg) if msg.contains("aw_iela.csv")));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_run_directories_are_unique() {
        let work = tempfile::tempdir().unwrap();
        let payload = zip_of(&[("AW_IELA.CSV", "h\n")]);
        let a = extract(&payload, work.path(), RegisterKind::Address).unwrap();
        let b = extract(&payload, work.path(), RegisterKind::Address).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn test_plain_payload_becomes_single_source_file() {
        let work = tempfile::tempdir().unwrap();
        let snapshot = fetcher(work.path())
            .unpack(RegisterKind::Company, b"regcode;name\n".to_vec())
            .await
            .unwrap();
        assert!(snapshot.find("register.csv").is_some());
    }

    #[tokio::test]
    async fn test_plain_payload_for_multi_file_register_is_rejected() {
        let work = tempfile::tempdir().unwrap();
        let err = fetcher(work.path())
            .unpack(RegisterKind::Address, b"KODS;TIPS_CD\n".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ExtractionFailed(_)));
    }

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/register.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"regcode;name\n".to_vec()))
            .mount(&server)
            .await;

        let work = tempfile::tempdir().unwrap();
        let body = fetcher(work.path())
            .fetch(&format!("{}/register.csv", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, b"regcode;name\n");
    }

    #[tokio::test]
    async fn test_fetch_non_success_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let work = tempfile::tempdir().unwrap();
        let err = fetcher(work.path()).fetch(&server.uri()).await.unwrap_err();
        match err {
            IngestError::DownloadFailed { reason, .. } => assert!(reason.contains("503")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let work = tempfile::tempdir().unwrap();
        let fetcher =
            ArchiveFetcher::new(Duration::from_secs(1), Duration::from_millis(200), work.path())
                .unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, IngestError::DownloadFailed { .. }));
    }
}
