//! System-of-record storage.
//!
//! - [`sqlite`] - The [`EventStore`] handle and its queries
//! - [`schema`] - Versioned schema creation and migrations

pub mod schema;
pub mod sqlite;

pub use schema::{init_schema, SCHEMA_VERSION};
pub use sqlite::EventStore;
