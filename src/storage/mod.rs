//! Storage Retry Controller: retry classification, backoff, and
//! the utm_source schema-drift degradation, wrapping a concrete SQLite store.

pub mod canonical;
pub mod kv;
pub mod retry;
pub mod sqlite;

pub use kv::KvStore;
pub use sqlite::SqliteStorage;
