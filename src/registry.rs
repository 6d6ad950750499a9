//! Clone lifecycle: the only place clone directories and records are created
//! or destroyed.
//!
//! Ordering rules:
//! - create: directory, payload and sidecar are complete before the record is
//!   committed, so a listed record always has a valid payload. A crash in
//!   between leaves an orphan directory, which reconciliation can adopt or
//!   purge.
//! - remove: the directory is deleted before the record. If deletion fails
//!   the record stays listed and removal can be retried.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clone_id::{
    created_at_from_millis, format_clone_id, now_millis, parse_clone_id, validate_identifier,
};
use crate::copier::{CancelToken, PayloadCopier, StreamCopier};
use crate::eligibility::{DenylistPolicy, EligibilityPolicy};
use crate::error::{
    CloneError, IneligibleReason, MetadataError, ReconcileError, RemoveError, RenameError,
};
use crate::inventory::{SourceInventory, StaticInventory};
use crate::metadata::MetadataStore;
use crate::model::{CloneRecord, CloneSidecar, SourceArtifact, PAYLOAD_FILENAME};
use crate::reconcile::Reconciler;

/// Attempts at finding a free directory name before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 32;

/// Basic registry status.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub root: PathBuf,
    pub clones: u64,
    pub payload_bytes: u64,
}

/// Creates, lists, renames and removes clones under one storage root.
pub struct CloneRegistry {
    root: PathBuf,
    host_identifier: String,
    store: Arc<dyn MetadataStore>,
    policy: Arc<dyn EligibilityPolicy>,
    copier: Arc<dyn PayloadCopier>,
    inventory: Arc<dyn SourceInventory>,
    /// Per source identifier: serializes creation.
    source_locks: KeyedLocks<()>,
    /// Per source identifier: last millis handed out. Never evicted.
    issued_millis: Mutex<HashMap<String, u64>>,
    /// Per clone id: serializes rename and remove of the same clone.
    clone_locks: KeyedLocks<()>,
    /// Clone directories created but not yet committed (or rolled back).
    in_flight: Mutex<BTreeSet<String>>,
}

impl CloneRegistry {
    /// Open a registry rooted at `root`, creating the directory if needed.
    ///
    /// Defaults: allow-all policy, [`StreamCopier`], empty inventory.
    pub fn open(
        root: &Path,
        host_identifier: &str,
        store: Arc<dyn MetadataStore>,
    ) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;
        Ok(Self {
            root,
            host_identifier: host_identifier.to_string(),
            store,
            policy: Arc::new(DenylistPolicy::allow_all()),
            copier: Arc::new(StreamCopier::default()),
            inventory: Arc::new(StaticInventory::default()),
            source_locks: KeyedLocks::default(),
            issued_millis: Mutex::new(HashMap::new()),
            clone_locks: KeyedLocks::default(),
            in_flight: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn EligibilityPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_copier(mut self, copier: Arc<dyn PayloadCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn SourceInventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sources offered for cloning, straight from the inventory.
    pub fn list_cloneable_sources(&self) -> anyhow::Result<Vec<SourceArtifact>> {
        self.inventory.sources()
    }

    /// Inventory source named `identifier`, if any.
    pub fn find_source(&self, identifier: &str) -> anyhow::Result<Option<SourceArtifact>> {
        Ok(self
            .inventory
            .sources()?
            .into_iter()
            .find(|s| s.identifier == identifier))
    }

    /// Clone `source` under a fresh id. Blocks for the duration of the copy.
    pub fn create_clone(
        &self,
        source: &SourceArtifact,
        display_name: &str,
    ) -> Result<CloneRecord, CloneError> {
        self.create_clone_cancellable(source, display_name, &CancelToken::new())
    }

    /// [`create_clone`](Self::create_clone) that stops at the next copy chunk
    /// once `cancel` fires. A cancelled creation is rolled back like any
    /// other copy failure.
    pub fn create_clone_cancellable(
        &self,
        source: &SourceArtifact,
        display_name: &str,
        cancel: &CancelToken,
    ) -> Result<CloneRecord, CloneError> {
        self.check_eligible(&source.identifier)?;

        self.source_locks.with(&source.identifier, |_| {
            let mut last_millis = self.last_issued_millis(&source.identifier);
            let allocated = self.allocate_dir(&source.identifier, &mut last_millis);
            lock(&self.issued_millis).insert(source.identifier.clone(), last_millis);
            let (clone_id, dir, millis) = allocated?;
            let result = self.populate(source, display_name, &clone_id, &dir, millis, cancel);
            if result.is_err() {
                self.rollback(&dir);
            }
            lock(&self.in_flight).remove(&clone_id);
            result
        })
    }

    fn check_eligible(&self, identifier: &str) -> Result<(), CloneError> {
        let reason = if identifier == self.host_identifier {
            IneligibleReason::SelfClone
        } else if let Err(why) = validate_identifier(identifier) {
            IneligibleReason::UnsafeIdentifier(why)
        } else if !self.policy.is_eligible(identifier) {
            IneligibleReason::Denylisted
        } else {
            return Ok(());
        };
        let err = CloneError::Ineligible {
            identifier: identifier.to_string(),
            reason,
        };
        tracing::info!(%err, "refusing to clone");
        Err(err)
    }

    /// Highest millis issued for `identifier`, seeded from the store the
    /// first time a source is seen. Callers hold the source lock.
    fn last_issued_millis(&self, identifier: &str) -> u64 {
        if let Some(&millis) = lock(&self.issued_millis).get(identifier) {
            return millis;
        }
        self.store
            .list()
            .iter()
            .filter_map(|record| parse_clone_id(&record.clone_id))
            .filter(|(ident, _)| *ident == identifier)
            .map(|(_, millis)| millis)
            .max()
            .unwrap_or(0)
    }

    /// Create `root/<identifier>_<millis>` with a millis strictly greater than
    /// the last one issued for this source. Registers the id as in flight.
    fn allocate_dir(
        &self,
        identifier: &str,
        last_millis: &mut u64,
    ) -> Result<(String, PathBuf, u64), CloneError> {
        let mut millis = now_millis().max(last_millis.saturating_add(1));
        let mut last_err = None;
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let clone_id = format_clone_id(identifier, millis);
            let dir = self.root.join(&clone_id);
            let mut in_flight = lock(&self.in_flight);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    in_flight.insert(clone_id.clone());
                    *last_millis = millis;
                    return Ok((clone_id, dir, millis));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    *last_millis = millis;
                    millis += 1;
                    last_err = Some(e);
                }
                Err(source) => return Err(CloneError::StorageUnavailable { path: dir, source }),
            }
        }
        Err(CloneError::StorageUnavailable {
            path: self.root.clone(),
            source: last_err.unwrap_or_else(|| ErrorKind::AlreadyExists.into()),
        })
    }

    fn populate(
        &self,
        source: &SourceArtifact,
        display_name: &str,
        clone_id: &str,
        dir: &Path,
        millis: u64,
        cancel: &CancelToken,
    ) -> Result<CloneRecord, CloneError> {
        let outcome = self
            .copier
            .copy(&source.payload_path, &dir.join(PAYLOAD_FILENAME), cancel)
            .map_err(|source| CloneError::CopyFailed {
                clone_id: clone_id.to_string(),
                source,
            })?;

        let record = CloneRecord {
            clone_id: clone_id.to_string(),
            source_identifier: source.identifier.clone(),
            display_name: display_name.to_string(),
            created_at: created_at_from_millis(millis),
            payload_size_bytes: outcome.bytes,
            storage_path: dir.to_path_buf(),
            payload_sha256: Some(outcome.sha256),
        };

        CloneSidecar::from(&record)
            .write_to(dir)
            .map_err(|source| CloneError::StorageUnavailable {
                path: dir.to_path_buf(),
                source,
            })?;

        self.store
            .put(&record)
            .map_err(|source| CloneError::MetadataWriteFailed {
                clone_id: clone_id.to_string(),
                source,
            })?;

        tracing::info!(
            clone_id,
            source = %source.identifier,
            bytes = record.payload_size_bytes,
            "created clone"
        );
        Ok(record)
    }

    fn rollback(&self, dir: &Path) {
        match fs::remove_dir_all(dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "rolled back clone directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(%err, dir = %dir.display(), "rollback left an orphan clone directory")
            }
        }
    }

    /// Every committed clone.
    pub fn list_clones(&self) -> Vec<CloneRecord> {
        self.store.list()
    }

    pub fn get_clone(&self, clone_id: &str) -> Result<CloneRecord, MetadataError> {
        self.store.get(clone_id)
    }

    /// Delete a clone's directory, then its record.
    pub fn remove_clone(&self, clone_id: &str) -> Result<(), RemoveError> {
        self.clone_locks.with(clone_id, |_| {
            let record = self.store.get(clone_id).map_err(|err| match err {
                MetadataError::NotFound(id) => RemoveError::NotFound(id),
                source => RemoveError::Metadata {
                    clone_id: clone_id.to_string(),
                    source,
                },
            })?;

            let dir = &record.storage_path;
            if dir == &self.root || !dir.starts_with(&self.root) {
                return Err(RemoveError::PartialRemoval {
                    clone_id: clone_id.to_string(),
                    path: dir.clone(),
                    source: std::io::Error::new(
                        ErrorKind::InvalidInput,
                        "clone directory is outside the storage root",
                    ),
                });
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(clone_id, "clone directory already gone");
                }
                Err(source) => {
                    return Err(RemoveError::PartialRemoval {
                        clone_id: clone_id.to_string(),
                        path: dir.clone(),
                        source,
                    })
                }
            }

            self.store.delete(clone_id).map_err(|err| match err {
                MetadataError::NotFound(id) => RemoveError::NotFound(id),
                source => RemoveError::Metadata {
                    clone_id: clone_id.to_string(),
                    source,
                },
            })?;
            tracing::info!(clone_id, "removed clone");
            Ok(())
        })
    }

    /// Change a clone's display name in both the record and the sidecar.
    pub fn rename_clone(
        &self,
        clone_id: &str,
        display_name: &str,
    ) -> Result<CloneRecord, RenameError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(RenameError::EmptyName);
        }
        self.clone_locks.with(clone_id, |_| {
            let mut record = self.store.get(clone_id).map_err(|err| match err {
                MetadataError::NotFound(id) => RenameError::NotFound(id),
                other => RenameError::Metadata(other),
            })?;
            let previous = CloneSidecar::from(&record);
            record.display_name = display_name.to_string();

            let dir = &record.storage_path;
            CloneSidecar::from(&record)
                .write_to(dir)
                .map_err(|source| RenameError::Sidecar {
                    path: dir.clone(),
                    source,
                })?;
            if let Err(err) = self.store.put(&record) {
                if let Err(restore) = previous.write_to(dir) {
                    tracing::warn!(
                        err = %restore,
                        dir = %dir.display(),
                        "could not restore sidecar, it now disagrees with the record"
                    );
                }
                return Err(err.into());
            }
            tracing::info!(clone_id, display_name, "renamed clone");
            Ok(record)
        })
    }

    pub fn status(&self) -> StoreStatus {
        let records = self.store.list();
        StoreStatus {
            root: self.root.clone(),
            clones: records.len() as u64,
            payload_bytes: records.iter().map(|r| r.payload_size_bytes).sum(),
        }
    }

    /// Read-only scan of the storage root. Clones still being created are
    /// not reported.
    pub fn scan_storage(&self) -> Result<Vec<CloneRecord>, ReconcileError> {
        let in_flight = lock(&self.in_flight);
        self.reconciler(&in_flight).scan()
    }

    /// Adopt complete clone directories missing from the metadata store.
    pub fn repair(&self) -> Result<Vec<CloneRecord>, ReconcileError> {
        let in_flight = lock(&self.in_flight);
        self.reconciler(&in_flight).repair(self.store.as_ref())
    }

    /// Delete clone directories without a record. New creations wait until
    /// the purge is done.
    pub fn purge_orphans(&self) -> Result<Vec<PathBuf>, ReconcileError> {
        let in_flight = lock(&self.in_flight);
        self.reconciler(&in_flight).purge_orphans(self.store.as_ref())
    }

    fn reconciler(&self, in_flight: &BTreeSet<String>) -> Reconciler {
        Reconciler::new(&self.root).excluding(in_flight.iter().cloned())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One mutex per key, dropped again once nobody holds or waits on it.
struct KeyedLocks<T> {
    slots: Mutex<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T> Default for KeyedLocks<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Default> KeyedLocks<T> {
    fn with<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = lock(&self.slots).entry(key.to_string()).or_default().clone();
        let result = {
            let mut state = lock(&*slot);
            f(&mut *state)
        };
        let mut slots = lock(&self.slots);
        // Map entry plus ours: nobody else is waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }
        result
    }
}
