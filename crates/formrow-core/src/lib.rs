//! Core types and collaborator contracts for the formrow record store.
//!
//! This crate performs no I/O. It defines the record model, the save and
//! list request contracts, validated dedup-rule configuration, the opaque
//! page-token codec, and the traits every tabular/cache/property/lock
//! backend implements. `formrow-engine` builds the consistency layer on top.

pub mod dedup;
pub mod error;
pub mod form;
pub mod listing;
pub mod page;
pub mod record;
pub mod store;

pub use error::{ConfigError, StoreError};
