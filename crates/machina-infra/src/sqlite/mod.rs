//! SQLite storage layer.
//!
//! Run snapshots backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod run;

pub use pool::{DatabasePool, default_database_url};
pub use run::SqliteRunStore;
