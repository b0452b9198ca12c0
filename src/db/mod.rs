//! Metadata store
//!
//! Job history and schema registry state live in one embedded SQLite file.
//! Each concern adds its queries as an `impl MetadataStore` block in its own
//! module.

pub mod job_history;
pub mod schema_store;
mod store;

pub use store::MetadataStore;
