//! Raw rows to typed records
//!
//! Mapping is positional, driven by the [`SchemaEntry`] of the file, and independent per row.
//! Rows flagged with the source's error status are dropped without being counted as
//! failures. A field-count mismatch or an untypable value is a row-level error; whether it
//! aborts the file depends on the entry's [`RowPolicy`].

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::catalog::{Field, RecordTarget, RowPolicy, SchemaEntry};
use crate::error::{IngestError, Result};
use crate::models::{AddressEntry, AddressLevel, CompanyEntry, NormalizedRecord, RawRow};

/// Date layouts seen in the registers, tried in order
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y.%m.%d", "%d.%m.%Y"];

/// Outcome of mapping one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapped {
    Record(NormalizedRecord),
    /// Row carries the source's error status
    Dropped,
}

/// Records mapped from one chunk of rows, plus what was left out
#[derive(Debug, Default)]
pub struct MappedChunk {
    pub records: Vec<NormalizedRecord>,
    pub dropped: usize,
    pub skipped: usize,
}

/// Converts [`RawRow`]s into [`NormalizedRecord`]s
#[derive(Debug, Clone, Copy)]
pub struct RowMapper {
    processing_date: NaiveDate,
}

impl RowMapper {
    /// `processing_date` fills in a missing last-update date
    pub fn new(processing_date: NaiveDate) -> Self {
        Self { processing_date }
    }

    pub fn map_row(&self, raw: &RawRow, schema: &SchemaEntry) -> Result<Mapped> {
        if raw.len() != schema.expected_fields() {
            return Err(IngestError::MalformedRow {
                file: schema.file_name.to_string(),
                line: raw.line,
                expected: schema.expected_fields(),
                actual: raw.len(),
            });
        }

        let row = Row { raw, schema };

        if let Some(sentinel) = schema.error_status {
            if row.text(Field::Status) == sentinel {
                debug!(file = schema.file_name, line = raw.line, "Dropping row with error status");
                return Ok(Mapped::Dropped);
            }
        }

        let record = match schema.target {
            RecordTarget::Address(level) => NormalizedRecord::Address(self.address(&row, level)?),
            RecordTarget::Company => NormalizedRecord::Company(self.company(&row)?),
        };
        Ok(Mapped::Record(record))
    }

    /// Map a chunk, applying the row policy to row-level errors
    pub fn map_chunk(&self, rows: &[RawRow], schema: &SchemaEntry) -> Result<MappedChunk> {
        let mut chunk = MappedChunk {
            records: Vec::with_capacity(rows.len()),
            ..MappedChunk::default()
        };

        for raw in rows {
            match self.map_row(raw, schema) {
                Ok(Mapped::Record(record)) => chunk.records.push(record),
                Ok(Mapped::Dropped) => chunk.dropped += 1,
                Err(e) if e.is_row_level() && schema.row_policy == RowPolicy::SkipAndLog => {
                    warn!(file = schema.file_name, line = raw.line, error = %e, raw = ?raw.fields, "Skipping row");
                    chunk.skipped += 1;
                }
                Err(e) => {
                    warn!(file = schema.file_name, line = raw.line, raw = ?raw.fields, "Rejected row");
                    return Err(e);
                }
            }
        }

        Ok(chunk)
    }

    fn address(&self, row: &Row<'_>, level: AddressLevel) -> Result<AddressEntry> {
        let name = row.text(Field::Name).to_string();
        let full_name = match row.text(Field::FullName).trim() {
            "" => name.clone(),
            full => full.to_string(),
        };

        Ok(AddressEntry {
            code: row.code(Field::ExternalCode)?,
            type_code: row.number(Field::TypeCode)?,
            level,
            status: row.text(Field::Status).trim().to_string(),
            parent_code: row.code_or_zero(Field::ParentCode)?,
            parent_type_code: row.number_or_zero(Field::ParentTypeCode)?,
            sort_name: row.text(Field::SortKey).to_string(),
            name,
            postal_code: row.optional(Field::PostalCode),
            valid_from: row.date(Field::ValidFrom)?,
            valid_to: row.date(Field::ValidTo)?,
            updated_on: row.date(Field::UpdatedOn)?.unwrap_or(self.processing_date),
            full_name,
            region_code: row.optional(Field::RegionCode),
        })
    }

    fn company(&self, row: &Row<'_>) -> Result<CompanyEntry> {
        let name = normalize_name(row.text(Field::Name));
        let display_name = display_name(
            &normalize_name(row.text(Field::NameInQuotes)),
            &normalize_name(row.text(Field::NameBeforeQuotes)),
            &name,
        );

        Ok(CompanyEntry {
            reg_code: row.code(Field::ExternalCode)?,
            type_code: row.text(Field::TypeCode).trim().to_string(),
            type_name: row.text(Field::TypeName).trim().to_string(),
            status: row.optional(Field::Status),
            address_code: row.code_or_zero(Field::ParentCode)?,
            sort_name: sort_name(&display_name),
            name,
            display_name,
            address: row.optional(Field::Address),
            postal_code: row.optional(Field::PostalCode),
            registered_on: row.date(Field::ValidFrom)?,
            terminated_on: row.date(Field::ValidTo)?,
            updated_on: row.date(Field::UpdatedOn)?.unwrap_or(self.processing_date),
            region_code: row.optional(Field::RegionCode),
        })
    }
}

/// Field access for one row. Fields absent from the layout read as empty.
struct Row<'a> {
    raw: &'a RawRow,
    schema: &'a SchemaEntry,
}

impl<'a> Row<'a> {
    fn text(&self, field: Field) -> &'a str {
        self.schema
            .position(field)
            .and_then(|i| self.raw.fields.get(i))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn optional(&self, field: Field) -> Option<String> {
        match self.text(field).trim() {
            "" => None,
            value => Some(value.to_string()),
        }
    }

    fn invalid(&self, field: Field) -> IngestError {
        IngestError::InvalidField {
            file: self.schema.file_name.to_string(),
            line: self.raw.line,
            column: self.schema.column_name(field),
            value: self.text(field).to_string(),
        }
    }

    fn code(&self, field: Field) -> Result<i64> {
        self.text(field).trim().parse().map_err(|_| self.invalid(field))
    }

    fn code_or_zero(&self, field: Field) -> Result<i64> {
        match self.text(field).trim() {
            "" => Ok(0),
            value => value.parse().map_err(|_| self.invalid(field)),
        }
    }

    fn number(&self, field: Field) -> Result<i32> {
        self.text(field).trim().parse().map_err(|_| self.invalid(field))
    }

    fn number_or_zero(&self, field: Field) -> Result<i32> {
        match self.text(field).trim() {
            "" => Ok(0),
            value => value.parse().map_err(|_| self.invalid(field)),
        }
    }

    fn date(&self, field: Field) -> Result<Option<NaiveDate>> {
        let value = self.text(field).trim();
        if value.is_empty() {
            return Ok(None);
        }
        parse_date(value).map(Some).ok_or_else(|| self.invalid(field))
    }
}

/// Parse the date part of a register timestamp
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let date = value
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()
        .unwrap_or(value);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date, fmt).ok())
}

/// Trim, collapse inner whitespace and upper-case
pub fn normalize_name(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

/// Name shown to users: the quoted part of the legal name when there is one
pub fn display_name(in_quotes: &str, before_quotes: &str, name: &str) -> String {
    [in_quotes, before_quotes]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or(name)
        .to_string()
}

fn sort_name(display_name: &str) -> String {
    display_name
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}
