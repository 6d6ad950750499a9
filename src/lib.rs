//! Local repository of cloned application payloads.
//!
//! A clone is a byte-for-byte copy of an installed application's payload,
//! stored in its own directory under a generated id and recorded in a
//! metadata store:
//!
//! ```text
//! <data dir>/clone-store/
//!     clones.json                       metadata store
//!     clones/
//!         com.example.app_1700000000000/
//!             payload                   the copied binary
//!             clone.json                identity sidecar
//! ```
//!
//! # Components
//!
//! - [`metadata`] - durable clone id -> [`CloneRecord`] mapping
//! - [`copier`] - streamed, cancellable, all-or-nothing payload copy
//! - [`registry`] - clone creation and removal with rollback
//! - [`reconcile`] - rebuild metadata from the storage root
//!
//! # Example
//!
//! ```rust,ignore
//! use clone_store::{open_registry, CloneStoreConfig};
//!
//! let config = CloneStoreConfig::discover(None)?;
//! let registry = open_registry(&config)?;
//! for source in registry.list_cloneable_sources()? {
//!     let record = registry.create_clone(&source, "My Clone")?;
//!     println!("{} -> {}", record.clone_id, record.storage_path.display());
//! }
//! ```

pub mod clone_id;
pub mod config;
pub mod copier;
pub mod eligibility;
pub mod error;
pub mod inventory;
pub mod metadata;
pub mod model;
pub mod reconcile;
pub mod registry;

pub use config::CloneStoreConfig;
pub use copier::{CancelToken, CopyOutcome, PayloadCopier, StreamCopier};
pub use eligibility::{DenylistPolicy, EligibilityPolicy};
pub use error::{
    CloneError, CopyError, IneligibleReason, MetadataError, ReconcileError, RemoveError,
    RenameError,
};
pub use inventory::{SourceInventory, StaticInventory};
pub use metadata::{JsonFileMetadataStore, MemoryMetadataStore, MetadataStore};
pub use model::{CloneRecord, SourceArtifact};
pub use reconcile::Reconciler;
pub use registry::{CloneRegistry, StoreStatus};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Open a registry wired from configuration: JSON metadata store, denylist
/// policy, streamed copier and the configured sources as inventory.
pub fn open_registry(config: &CloneStoreConfig) -> Result<CloneRegistry> {
    let store = JsonFileMetadataStore::open(&config.metadata_path).with_context(|| {
        format!(
            "opening metadata store '{}'",
            config.metadata_path.display()
        )
    })?;
    let registry = CloneRegistry::open(&config.storage_root, &config.host_identifier, Arc::new(store))
        .with_context(|| {
            format!(
                "opening storage root '{}'",
                config.storage_root.display()
            )
        })?
        .with_policy(Arc::new(DenylistPolicy::new(config.denylist.iter().cloned())))
        .with_copier(Arc::new(StreamCopier::new(config.copy_buffer_bytes)))
        .with_inventory(Arc::new(StaticInventory::new(config.sources.clone())));
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn open_registry_from_config() {
        let tmp = TempDir::new().unwrap();
        let payload = tmp.path().join("app.bin");
        fs::write(&payload, b"binary").unwrap();
        let config = CloneStoreConfig {
            storage_root: tmp.path().join("clones"),
            metadata_path: tmp.path().join("clones.json"),
            host_identifier: "com.example.cloner".to_string(),
            denylist: vec!["com.example.blocked".to_string()],
            copy_buffer_bytes: 4096,
            sources: vec![SourceArtifact {
                identifier: "com.example.app".to_string(),
                display_name: "App".to_string(),
                version_label: "1.0".to_string(),
                is_protected: false,
                payload_path: payload,
            }],
        };

        let registry = open_registry(&config).unwrap();
        let sources = registry.list_cloneable_sources().unwrap();
        let record = registry.create_clone(&sources[0], "My Clone").unwrap();
        assert_eq!(record.payload_size_bytes, 6);
        assert!(config.metadata_path.is_file());

        // A fresh registry over the same files sees the clone.
        let reopened = open_registry(&config).unwrap();
        assert_eq!(reopened.list_clones(), vec![record]);
    }
}
