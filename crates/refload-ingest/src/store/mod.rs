//! [`TableStore`](crate::loader::TableStore) implementations
//!
//! - [`PgStore`]: PostgreSQL through a `sqlx` pool
//! - [`MemoryStore`]: in-process tables for dry runs and tests

mod memory;
mod postgres;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;
