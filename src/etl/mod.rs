//! Staged ingestion pipeline
//! Raw payloads land in the staging buffer exactly as received; the
//! transform engine turns them into canonical rows or classified errors;
//! the loader commits each batch transactionally.

pub mod loader;
pub mod mapping;
pub mod transform;
