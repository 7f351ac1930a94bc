//! Refload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup, and content digests for the refload workspace.
//!
//! - **Error Handling**: [`RefloadError`] and the [`Result`] alias
//! - **Checksums**: SHA-256 digests used to detect unchanged snapshots
//! - **Logging**: `tracing` subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use refload_common::checksum::sha256_file;
//! use refload_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "snapshot fingerprint");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{RefloadError, Result};
