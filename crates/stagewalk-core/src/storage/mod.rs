//! # Storage
//!
//! Durable backends for records and snapshots.

pub mod redb_records;

pub use redb_records::RedbRecordStore;
