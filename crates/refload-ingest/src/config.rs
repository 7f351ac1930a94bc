//! Import configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by the binary).
//! Unset variables fall back to the `DEFAULT_*` constants; set but unparsable ones are
//! errors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{RegisterKind, RowPolicy, SchemaCatalog, SchemaEntry};
use crate::error::{IngestError, Result};
use crate::loader::LoadStrategy;

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/refload";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BATCH_SIZE: usize = 2_000;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Settings for import runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Snapshot location of the address register
    pub address_url: Option<String>,
    /// Snapshot location of the company register
    pub company_url: Option<String>,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout, body included
    pub read_timeout_secs: u64,
    /// Rows per INSERT statement
    pub batch_size: usize,
    /// Concurrent mapping tasks per file
    pub map_workers: usize,
    /// Mapped batches buffered ahead of the writer
    pub channel_capacity: usize,
    /// Parent of the per-run extraction directories
    pub work_dir: PathBuf,
    pub load_strategy: LoadStrategy,
    /// Source files whose malformed rows are skipped instead of failing the run
    pub skip_malformed: Vec<String>,
    /// Where change-detection state survives restarts; in memory only when unset
    pub state_file: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            address_url: None,
            company_url: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            map_workers: default_map_workers(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            work_dir: std::env::temp_dir(),
            load_strategy: LoadStrategy::default(),
            skip_malformed: Vec::new(),
            state_file: None,
        }
    }
}

fn default_map_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Non-empty value of an environment variable
fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| IngestError::Config(format!("{} has invalid value '{}'", name, raw))),
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            address_url: var("REFLOAD_ADDRESS_URL"),
            company_url: var("REFLOAD_COMPANY_URL"),
            connect_timeout_secs: parse_var(
                "REFLOAD_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            read_timeout_secs: parse_var("REFLOAD_READ_TIMEOUT_SECS", defaults.read_timeout_secs)?,
            batch_size: parse_var("REFLOAD_BATCH_SIZE", defaults.batch_size)?,
            map_workers: parse_var("REFLOAD_MAP_WORKERS", defaults.map_workers)?,
            channel_capacity: parse_var("REFLOAD_CHANNEL_CAPACITY", defaults.channel_capacity)?,
            work_dir: var("REFLOAD_WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            load_strategy: parse_var("REFLOAD_LOAD_STRATEGY", defaults.load_strategy)?,
            skip_malformed: var("REFLOAD_SKIP_MALFORMED")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            state_file: var("REFLOAD_STATE_FILE").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(IngestError::Config(format!(
                "REFLOAD_BATCH_SIZE must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.map_workers == 0 {
            return Err(IngestError::Config(
                "REFLOAD_MAP_WORKERS must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(IngestError::Config(
                "REFLOAD_CHANNEL_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(IngestError::Config(
                "HTTP timeouts must be greater than 0".to_string(),
            ));
        }
        if self.database_max_connections == 0 {
            return Err(IngestError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }
        for name in &self.skip_malformed {
            if SchemaCatalog::lookup(name).is_none() {
                return Err(IngestError::Config(format!(
                    "REFLOAD_SKIP_MALFORMED names unknown source file '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Configured snapshot location of a register
    pub fn source_url(&self, register: RegisterKind) -> Result<&str> {
        let (url, var) = match register {
            RegisterKind::Address => (&self.address_url, "REFLOAD_ADDRESS_URL"),
            RegisterKind::Company => (&self.company_url, "REFLOAD_COMPANY_URL"),
        };
        url.as_deref()
            .ok_or_else(|| IngestError::Config(format!("{} is not set", var)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Catalog entries of a register with row-policy overrides applied
    pub fn schemas(&self, register: RegisterKind) -> Vec<SchemaEntry> {
        SchemaCatalog::entries(register)
            .iter()
            .map(|entry| {
                if self
                    .skip_malformed
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(entry.file_name))
                {
                    entry.with_row_policy(RowPolicy::SkipAndLog)
                } else {
                    *entry
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "REFLOAD_ADDRESS_URL",
        "REFLOAD_COMPANY_URL",
        "REFLOAD_CONNECT_TIMEOUT_SECS",
        "REFLOAD_READ_TIMEOUT_SECS",
        "REFLOAD_BATCH_SIZE",
        "REFLOAD_MAP_WORKERS",
        "REFLOAD_CHANNEL_CAPACITY",
        "REFLOAD_WORK_DIR",
        "REFLOAD_LOAD_STRATEGY",
        "REFLOAD_SKIP_MALFORMED",
        "REFLOAD_STATE_FILE",
    ];

    fn clear_env() {
        for name in VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = IngestConfig::from_env().unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.load_strategy, LoadStrategy::InPlace);
        assert!(config.map_workers > 0);
        assert!(config.state_file.is_none());
        assert!(config.source_url(RegisterKind::Address).is_err());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("REFLOAD_COMPANY_URL", "https://example.test/register.csv");
        std::env::set_var("REFLOAD_BATCH_SIZE", "500");
        std::env::set_var("REFLOAD_LOAD_STRATEGY", "shadow_swap");
        std::env::set_var("REFLOAD_SKIP_MALFORMED", "AW_EKA.CSV, aw_dziv.csv");
        std::env::set_var("REFLOAD_STATE_FILE", "/var/lib/refload/state.json");

        let config = IngestConfig::from_env().unwrap();
        clear_env();

        assert_eq!(
            config.source_url(RegisterKind::Company).unwrap(),
            "https://example.test/register.csv"
        );
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.load_strategy, LoadStrategy::ShadowSwap);
        assert_eq!(config.state_file, Some(PathBuf::from("/var/lib/refload/state.json")));

        let schemas = config.schemas(RegisterKind::Address);
        let lenient: Vec<&str> = schemas
            .iter()
            .filter(|s| s.row_policy == RowPolicy::SkipAndLog)
            .map(|s| s.file_name)
            .collect();
        assert_eq!(lenient, vec!["AW_EKA.CSV", "AW_DZIV.CSV"]);
    }

    #[test]
    #[serial]
    fn test_batch_size_bounds() {
        clear_env();
        std::env::set_var("REFLOAD_BATCH_SIZE", "0");
        assert!(IngestConfig::from_env().is_err());
        std::env::set_var("REFLOAD_BATCH_SIZE", "10001");
        assert!(IngestConfig::from_env().is_err());
        std::env::set_var("REFLOAD_BATCH_SIZE", "10000");
        assert!(IngestConfig::from_env().is_ok());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparsable_values_are_errors() {
        clear_env();
        std::env::set_var("REFLOAD_READ_TIMEOUT_SECS", "soon");
        let err = IngestConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("REFLOAD_READ_TIMEOUT_SECS"));

        clear_env();
        std::env::set_var("REFLOAD_LOAD_STRATEGY", "copy");
        assert!(IngestConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_unknown_skip_file_rejected() {
        let config = IngestConfig {
            skip_malformed: vec!["AW_NOPE.CSV".to_string()],
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
