//! Infrastructure layer for Machina.
//!
//! Implements the `RunStore` port from `machina-core` on SQLite and loads
//! engine configuration and graph definitions from disk.

pub mod config;
pub mod definition;
pub mod sqlite;
