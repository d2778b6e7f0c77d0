//! SQLite backend for the formrow engine.
//!
//! One database file plays all four collaborator roles: tabular store,
//! TTL cache, property store and advisory lock. Access is synchronous and
//! serialised through a single connection.

mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteBackend;
