//! Scalefeed measurement model and durable record store
//!
//! The ingestion core treats persistence as an external collaborator with
//! two operations: `create` a record and `find_latest`. This crate defines
//! that seam ([`RecordStore`]) together with a SQLite implementation for the
//! daemon and an in-memory one for tests and ephemeral runs.

pub mod database;
pub mod models;
pub mod store;

pub use database::SqliteRecordStore;
pub use models::{
    LivePayload, Measurement, NewRecord, StoredRecord, STORED_UNKNOWN_FEE_TYPE, UNKNOWN_FEE_TYPE,
};
pub use store::{MemoryRecordStore, RecordStore};
