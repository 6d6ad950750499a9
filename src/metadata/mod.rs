//! Durable mapping from clone id to [`CloneRecord`].
//!
//! The registry only talks to the [`MetadataStore`] trait. Two backends ship
//! with the crate:
//! - [`MemoryMetadataStore`] for tests and ephemeral use
//! - [`JsonFileMetadataStore`], a single JSON document on disk

mod json_file;
mod memory;

pub use json_file::JsonFileMetadataStore;
pub use memory::MemoryMetadataStore;

use crate::error::MetadataResult;
use crate::model::CloneRecord;

/// Clone metadata storage.
///
/// Every operation is atomic with respect to the others: no reader ever
/// observes a partially written record.
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the record keyed by `record.clone_id`.
    fn put(&self, record: &CloneRecord) -> MetadataResult<()>;

    /// Fetch one record, or [`MetadataError::NotFound`](crate::error::MetadataError::NotFound).
    fn get(&self, clone_id: &str) -> MetadataResult<CloneRecord>;

    /// All records, sorted by clone id.
    ///
    /// An absent or unreadable backing store yields an empty list; callers
    /// recover through reconciliation.
    fn list(&self) -> Vec<CloneRecord>;

    /// Remove one record, or [`MetadataError::NotFound`](crate::error::MetadataError::NotFound).
    fn delete(&self, clone_id: &str) -> MetadataResult<()>;

    /// Drop every record, replacing an unreadable backing store.
    fn clear(&self) -> MetadataResult<()>;

    /// Verify the backing store can be read.
    ///
    /// `list()` hides an unreadable store behind an empty result; anything
    /// that deletes data based on a listing must check this first.
    fn health_check(&self) -> MetadataResult<()> {
        Ok(())
    }
}
