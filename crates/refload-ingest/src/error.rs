//! Import failure taxonomy
//!
//! Every way a run can end badly maps to one [`IngestError`] variant. Callers of the
//! trigger interface only ever see [`IngestError::public_message`]; the detailed
//! `Display` text (file names, line numbers, column counts) is for logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for import operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that terminate an import run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Download failed for {url}: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("Download from {url} produced no data")]
    EmptyDownload { url: String },

    #[error("Archive extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Expected source file {file} is missing from the snapshot")]
    MissingSourceFile { file: String },

    #[error("{file} line {line}: expected {expected} fields, found {actual}")]
    MalformedRow {
        file: String,
        line: usize,
        expected: usize,
        actual: usize,
    },

    #[error("{file} line {line}: quoted field is never closed before end of file")]
    UnterminatedRecord { file: String, line: usize },

    #[error("{file} line {line}: column {column} has unusable value '{value}'")]
    InvalidField {
        file: String,
        line: usize,
        column: &'static str,
        value: String,
    },

    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Import state error: {0}")]
    State(#[from] refload_common::RefloadError),

    #[error("Import cancelled")]
    Cancelled,
}

/// Coarse classification of [`IngestError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DownloadFailed,
    EmptyDownload,
    ExtractionFailed,
    MissingSourceFile,
    MalformedRow,
    PersistenceFailed,
    Config,
    Cancelled,
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            IngestError::EmptyDownload { .. } => ErrorKind::EmptyDownload,
            IngestError::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            IngestError::MissingSourceFile { .. } => ErrorKind::MissingSourceFile,
            IngestError::MalformedRow { .. }
            | IngestError::UnterminatedRecord { .. }
            | IngestError::InvalidField { .. } => ErrorKind::MalformedRow,
            IngestError::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            IngestError::Config(_) | IngestError::State(_) => ErrorKind::Config,
            IngestError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this failure belongs to one source row and can be skipped under a lenient
    /// row policy
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            IngestError::MalformedRow { .. } | IngestError::InvalidField { .. }
        )
    }

    /// Message safe to hand back to whoever triggered the run
    pub fn public_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::DownloadFailed => "snapshot download failed",
            ErrorKind::EmptyDownload => "snapshot download produced no data",
            ErrorKind::ExtractionFailed => "snapshot archive could not be extracted",
            ErrorKind::MissingSourceFile => "snapshot archive is incomplete",
            ErrorKind::MalformedRow => "snapshot contains malformed data",
            ErrorKind::PersistenceFailed => "loading the snapshot into the database failed",
            ErrorKind::Config => "import is misconfigured",
            ErrorKind::Cancelled => "import was cancelled",
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::PersistenceFailed(err.to_string())
    }
}

impl From<zip::result::ZipError> for IngestError {
    fn from(err: zip::result::ZipError) -> Self {
        IngestError::ExtractionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_errors_share_a_kind() {
        let malformed = IngestError::MalformedRow {
            file: "AW_IELA.CSV".to_string(),
            line: 12,
            expected: 14,
            actual: 13,
        };
        let unterminated = IngestError::UnterminatedRecord {
            file: "AW_IELA.CSV".to_string(),
            line: 90,
        };

        assert_eq!(malformed.kind(), ErrorKind::MalformedRow);
        assert_eq!(unterminated.kind(), ErrorKind::MalformedRow);
        assert!(malformed.is_row_level());
        assert!(!unterminated.is_row_level());
    }

    #[test]
    fn test_public_message_hides_schema_details() {
        let err = IngestError::MalformedRow {
            file: "AW_EKA.CSV".to_string(),
            line: 7,
            expected: 17,
            actual: 3,
        };

        assert!(err.to_string().contains("AW_EKA.CSV"));
        assert!(!err.public_message().contains("AW_EKA"));
        assert!(!err.public_message().contains("17"));
    }
}
