//! # Courier Store
//! SQLite reference implementation of the directory, link-token, and
//! delivery-log collaborators. Production deployments that already have a
//! user directory implement the `courier-core` traits against it instead.

pub mod sqlite;

pub use sqlite::SqliteStore;
