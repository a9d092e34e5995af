//! Repository traits (ports).
//!
//! The infrastructure layer (machina-infra) implements these with SQLite.
//! The core crate never depends on a specific storage technology.

pub mod run;

pub use run::{InMemoryRunStore, RunStore};
