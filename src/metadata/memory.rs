use std::collections::BTreeMap;
use std::sync::RwLock;

use super::MetadataStore;
use crate::error::{MetadataError, MetadataResult};
use crate::model::CloneRecord;

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<String, CloneRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn put(&self, record: &CloneRecord) -> MetadataResult<()> {
        let mut records = self.records.write().map_err(|_| MetadataError::Poisoned)?;
        records.insert(record.clone_id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, clone_id: &str) -> MetadataResult<CloneRecord> {
        let records = self.records.read().map_err(|_| MetadataError::Poisoned)?;
        records
            .get(clone_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(clone_id.to_string()))
    }

    fn list(&self) -> Vec<CloneRecord> {
        match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn delete(&self, clone_id: &str) -> MetadataResult<()> {
        let mut records = self.records.write().map_err(|_| MetadataError::Poisoned)?;
        records
            .remove(clone_id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(clone_id.to_string()))
    }

    fn clear(&self) -> MetadataResult<()> {
        self.records
            .write()
            .map_err(|_| MetadataError::Poisoned)?
            .clear();
        Ok(())
    }
}
