//! Local store: diary content records and dispatch run history.
//!
//! - `model`: row views returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `plania_sync::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DispatchRunRow, StoredContent};
