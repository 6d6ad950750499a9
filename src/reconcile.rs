//! Rebuild and validate clone metadata from the storage root.
//!
//! Scanning is read-only. Adopting directories into a store ([`Reconciler::repair`])
//! and deleting unreferenced ones ([`Reconciler::purge_orphans`]) only happen
//! when asked for explicitly.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::clone_id::{created_at_from_millis, parse_clone_id, validate_identifier};
use crate::error::{MetadataError, ReconcileError};
use crate::metadata::MetadataStore;
use crate::model::{CloneRecord, CloneSidecar, PAYLOAD_FILENAME};

/// Scans the immediate subdirectories of a storage root.
#[derive(Debug, Clone)]
pub struct Reconciler {
    root: PathBuf,
    excluded: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            excluded: BTreeSet::new(),
        }
    }

    /// Leave these directory names alone (e.g. clones still being created).
    pub fn excluding<I>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.excluded.extend(names);
        self
    }

    /// Every directory holding a complete payload, as a synthesized record.
    ///
    /// Directories without a valid payload are skipped, never deleted.
    /// Results are sorted by clone id.
    pub fn scan(&self) -> Result<Vec<CloneRecord>, ReconcileError> {
        let mut records = Vec::new();
        for (name, dir) in self.clone_dirs()? {
            match inspect_clone_dir(&name, &dir) {
                Some(record) => records.push(record),
                None => tracing::debug!(dir = %dir.display(), "skipping directory without a valid clone payload"),
            }
        }
        records.sort_by(|a, b| a.clone_id.cmp(&b.clone_id));
        Ok(records)
    }

    /// Adopt every scanned clone the store does not know about.
    ///
    /// An unreadable store is cleared first, so the result reflects the disk.
    /// Returns the adopted records.
    pub fn repair(&self, store: &dyn MetadataStore) -> Result<Vec<CloneRecord>, ReconcileError> {
        if let Err(err) = store.health_check() {
            match err {
                MetadataError::Corrupt { .. } => {
                    tracing::warn!(%err, "replacing unreadable metadata during repair");
                    store.clear()?;
                }
                other => return Err(other.into()),
            }
        }

        let known: BTreeSet<String> = store.list().into_iter().map(|r| r.clone_id).collect();
        let mut adopted = Vec::new();
        for record in self.scan()? {
            if known.contains(&record.clone_id) {
                continue;
            }
            store.put(&record)?;
            tracing::info!(clone_id = %record.clone_id, "adopted clone directory");
            adopted.push(record);
        }
        Ok(adopted)
    }

    /// Delete every clone directory that no store record references.
    ///
    /// Refuses to run against an unreadable store. Directories that cannot be
    /// removed are logged and skipped. Returns the removed paths.
    pub fn purge_orphans(&self, store: &dyn MetadataStore) -> Result<Vec<PathBuf>, ReconcileError> {
        store.health_check()?;
        let referenced: BTreeSet<String> =
            store.list().into_iter().map(|r| r.clone_id).collect();

        let mut removed = Vec::new();
        for (name, dir) in self.clone_dirs()? {
            if referenced.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    tracing::info!(dir = %dir.display(), "purged orphan clone directory");
                    removed.push(dir);
                }
                Err(err) => {
                    tracing::warn!(%err, dir = %dir.display(), "failed to purge orphan clone directory");
                }
            }
        }
        Ok(removed)
    }

    /// `(name, path)` of candidate clone directories: immediate, non-hidden,
    /// not excluded. A missing root has none.
    fn clone_dirs(&self) -> Result<Vec<(String, PathBuf)>, ReconcileError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|err| ReconcileError::Io {
                path: err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.root.clone()),
                source: err.into(),
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name.starts_with('.') || self.excluded.contains(name) {
                continue;
            }
            dirs.push((name.to_string(), entry.path().to_path_buf()));
        }
        Ok(dirs)
    }
}

fn inspect_clone_dir(name: &str, dir: &Path) -> Option<CloneRecord> {
    let payload = fs::symlink_metadata(dir.join(PAYLOAD_FILENAME)).ok()?;
    if !payload.is_file() {
        return None;
    }
    let size = payload.len();

    match CloneSidecar::read_from(dir) {
        Ok(Some(sidecar)) => {
            if sidecar.clone_id != name || sidecar.payload_size_bytes != size {
                return None;
            }
            return Some(CloneRecord {
                clone_id: sidecar.clone_id,
                source_identifier: sidecar.source_identifier,
                display_name: sidecar.display_name,
                created_at: sidecar.created_at,
                payload_size_bytes: size,
                storage_path: dir.to_path_buf(),
                payload_sha256: sidecar.payload_sha256,
            });
        }
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(%err, dir = %dir.display(), "unreadable sidecar, falling back to directory name");
        }
    }

    let (identifier, millis) = parse_clone_id(name)?;
    validate_identifier(identifier).ok()?;
    Some(CloneRecord {
        clone_id: name.to_string(),
        source_identifier: identifier.to_string(),
        display_name: identifier.to_string(),
        created_at: created_at_from_millis(millis),
        payload_size_bytes: size,
        storage_path: dir.to_path_buf(),
        payload_sha256: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{JsonFileMetadataStore, MemoryMetadataStore};
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn make_clone_dir(root: &Path, name: &str, payload: &[u8]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PAYLOAD_FILENAME), payload).unwrap();
        dir
    }

    #[test]
    fn scan_derives_identity_from_directory_names() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        make_clone_dir(root, "com.example.app_1700000000000", b"abc");
        make_clone_dir(root, "org.my_vendor.tool_1700000000500", b"hello");

        let records = Reconciler::new(root).scan().unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].clone_id, "com.example.app_1700000000000");
        assert_eq!(records[0].source_identifier, "com.example.app");
        assert_eq!(records[0].display_name, "com.example.app");
        assert_eq!(records[0].payload_size_bytes, 3);
        assert_eq!(records[0].created_at.unix_timestamp(), 1_700_000_000);
        assert_eq!(records[0].storage_path, root.join("com.example.app_1700000000000"));

        assert_eq!(records[1].source_identifier, "org.my_vendor.tool");
        assert_eq!(records[1].created_at.millisecond(), 500);
    }

    #[test]
    fn scan_skips_incomplete_and_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        make_clone_dir(root, "com.example.app_1", b"ok");
        // Copy interrupted before the rename.
        let partial = root.join("com.example.app_2");
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("payload.partial"), b"half").unwrap();
        // No timestamp suffix.
        make_clone_dir(root, "not-a-clone", b"x");
        // Hidden and plain files are ignored.
        make_clone_dir(root, ".staging_3", b"x");
        fs::write(root.join("stray.txt"), b"x").unwrap();

        let records = Reconciler::new(root).scan().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.clone_id.as_str()).collect();
        assert_eq!(ids, vec!["com.example.app_1"]);

        // Nothing was deleted.
        assert!(partial.join("payload.partial").exists());
        assert!(root.join("not-a-clone").exists());
    }

    #[test]
    fn scan_prefers_sidecar_and_checks_size() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let dir = make_clone_dir(root, "com.example.app_10", b"four");
        CloneSidecar {
            clone_id: "com.example.app_10".to_string(),
            source_identifier: "com.example.app".to_string(),
            display_name: "My Clone".to_string(),
            created_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            payload_size_bytes: 4,
            payload_sha256: Some("00".repeat(32)),
        }
        .write_to(&dir)
        .unwrap();

        let truncated = make_clone_dir(root, "com.example.app_11", b"tw");
        CloneSidecar {
            clone_id: "com.example.app_11".to_string(),
            source_identifier: "com.example.app".to_string(),
            display_name: "Truncated".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            payload_size_bytes: 4,
            payload_sha256: None,
        }
        .write_to(&truncated)
        .unwrap();

        let records = Reconciler::new(root).scan().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].display_name, "My Clone");
        assert_eq!(records[0].payload_sha256.as_deref(), Some("00".repeat(32).as_str()));
        assert_eq!(records[0].created_at.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_root_scans_empty() {
        let tmp = TempDir::new().unwrap();
        let records = Reconciler::new(&tmp.path().join("absent")).scan().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn repair_repopulates_an_empty_store() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("clones");
        let mut expected = Vec::new();
        for i in 0..3 {
            expected.push(make_clone_dir(&root, &format!("com.example.app_{i}"), b"data"));
        }

        let store = MemoryMetadataStore::new();
        let adopted = Reconciler::new(&root).repair(&store).unwrap();
        assert_eq!(adopted.len(), 3);

        let paths: Vec<_> = store.list().into_iter().map(|r| r.storage_path).collect();
        assert_eq!(paths, expected);

        // Second pass adopts nothing new.
        assert!(Reconciler::new(&root).repair(&store).unwrap().is_empty());
    }

    #[test]
    fn repair_replaces_a_corrupt_document() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("clones");
        make_clone_dir(&root, "com.example.app_1", b"data");
        let meta = tmp.path().join("clones.json");
        fs::write(&meta, b"garbage").unwrap();

        let store = JsonFileMetadataStore::open(&meta).unwrap();
        let adopted = Reconciler::new(&root).repair(&store).unwrap();
        assert_eq!(adopted.len(), 1);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn purge_removes_only_unreferenced_directories() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("clones");
        let kept = make_clone_dir(&root, "com.example.app_1", b"data");
        let orphan = make_clone_dir(&root, "com.example.app_2", b"data");
        let busy = make_clone_dir(&root, "com.example.app_3", b"data");
        let empty = root.join("com.example.app_4");
        fs::create_dir_all(&empty).unwrap();

        let store = MemoryMetadataStore::new();
        let record = Reconciler::new(&root)
            .scan()
            .unwrap()
            .into_iter()
            .find(|r| r.clone_id == "com.example.app_1")
            .unwrap();
        store.put(&record).unwrap();

        let removed = Reconciler::new(&root)
            .excluding(["com.example.app_3".to_string()])
            .purge_orphans(&store)
            .unwrap();

        assert_eq!(removed, vec![orphan.clone(), empty.clone()]);
        assert!(kept.exists());
        assert!(busy.exists());
        assert!(!orphan.exists());
        assert!(!empty.exists());
    }

    #[test]
    fn purge_refuses_unreadable_store() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("clones");
        let dir = make_clone_dir(&root, "com.example.app_1", b"data");
        let meta = tmp.path().join("clones.json");
        fs::write(&meta, b"garbage").unwrap();

        let store = JsonFileMetadataStore::open(&meta).unwrap();
        assert!(Reconciler::new(&root).purge_orphans(&store).is_err());
        assert!(dir.exists());
    }
}
