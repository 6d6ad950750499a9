use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use super::MetadataStore;
use crate::error::{MetadataError, MetadataResult};
use crate::model::CloneRecord;

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MetadataDocument {
    version: u32,
    #[serde(default)]
    clones: Vec<CloneRecord>,
}

/// Metadata store backed by one JSON document.
///
/// Writers serialize on an in-process lock and an exclusive `fs2` lock on
/// `<file>.lock`, then replace the document through a temp file and rename.
/// Readers only ever see a complete document.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    path: PathBuf,
    guard: RwLock<()>,
}

impl JsonFileMetadataStore {
    /// Open the store at `path`, creating its parent directory if needed.
    /// The document itself is created on first write.
    pub fn open(path: &Path) -> MetadataResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| MetadataError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            guard: RwLock::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// `Ok(None)` when the document does not exist yet.
    fn read_document(&self) -> MetadataResult<Option<BTreeMap<String, CloneRecord>>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(MetadataError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let doc: MetadataDocument =
            serde_json::from_slice(&bytes).map_err(|source| MetadataError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        if doc.version != DOCUMENT_VERSION {
            return Err(MetadataError::Corrupt {
                path: self.path.clone(),
                source: <serde_json::Error as serde::de::Error>::custom(format!(
                    "unsupported metadata version {}",
                    doc.version
                )),
            });
        }
        Ok(Some(
            doc.clones
                .into_iter()
                .map(|record| (record.clone_id.clone(), record))
                .collect(),
        ))
    }

    fn write_document(&self, records: &BTreeMap<String, CloneRecord>) -> MetadataResult<()> {
        let doc = MetadataDocument {
            version: DOCUMENT_VERSION,
            clones: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;

        let tmp = self.tmp_path();
        let io_err = |source| MetadataError::Io {
            path: tmp.clone(),
            source,
        };
        let written = File::create(&tmp)
            .and_then(|mut f| {
                f.write_all(&bytes)?;
                f.sync_all()
            })
            .map_err(io_err);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            MetadataError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let n = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("metadata");
        self.path
            .with_file_name(format!(".{name}.tmp-{}-{n}", std::process::id()))
    }

    fn acquire_file_lock(&self) -> MetadataResult<File> {
        let lock_path = self.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| MetadataError::Io {
                path: lock_path.clone(),
                source,
            })?;
        lock_file
            .lock_exclusive()
            .map_err(|source| MetadataError::Io {
                path: lock_path,
                source,
            })?;
        Ok(lock_file)
    }

    /// Read-modify-write under both locks. The document is only rewritten
    /// when `f` succeeds.
    fn modify<F>(&self, f: F) -> MetadataResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, CloneRecord>) -> MetadataResult<()>,
    {
        let _guard = self.guard.write().map_err(|_| MetadataError::Poisoned)?;
        let lock_file = self.acquire_file_lock()?;
        let mut records = self.read_document()?.unwrap_or_default();
        f(&mut records)?;
        let result = self.write_document(&records);
        let _ = lock_file.unlock();
        result
    }
}

impl MetadataStore for JsonFileMetadataStore {
    fn put(&self, record: &CloneRecord) -> MetadataResult<()> {
        self.modify(|records| {
            records.insert(record.clone_id.clone(), record.clone());
            Ok(())
        })
    }

    fn get(&self, clone_id: &str) -> MetadataResult<CloneRecord> {
        let _guard = self.guard.read().map_err(|_| MetadataError::Poisoned)?;
        self.read_document()?
            .and_then(|mut records| records.remove(clone_id))
            .ok_or_else(|| MetadataError::NotFound(clone_id.to_string()))
    }

    fn list(&self) -> Vec<CloneRecord> {
        let Ok(_guard) = self.guard.read() else {
            return Vec::new();
        };
        match self.read_document() {
            Ok(Some(records)) => records.into_values().collect(),
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(%err, path = %self.path.display(), "metadata unreadable, listing no clones");
                Vec::new()
            }
        }
    }

    fn delete(&self, clone_id: &str) -> MetadataResult<()> {
        self.modify(|records| {
            records
                .remove(clone_id)
                .map(|_| ())
                .ok_or_else(|| MetadataError::NotFound(clone_id.to_string()))
        })
    }

    fn clear(&self) -> MetadataResult<()> {
        let _guard = self.guard.write().map_err(|_| MetadataError::Poisoned)?;
        let lock_file = self.acquire_file_lock()?;
        let result = self.write_document(&BTreeMap::new());
        let _ = lock_file.unlock();
        result
    }

    fn health_check(&self) -> MetadataResult<()> {
        let _guard = self.guard.read().map_err(|_| MetadataError::Poisoned)?;
        self.read_document().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::OffsetDateTime;

    fn record(id: &str) -> CloneRecord {
        CloneRecord {
            clone_id: id.to_string(),
            source_identifier: "com.example.app".to_string(),
            display_name: "App".to_string(),
            created_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            payload_size_bytes: 5,
            storage_path: PathBuf::from("/clones").join(id),
            payload_sha256: Some("ab".repeat(32)),
        }
    }

    #[test]
    fn survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/clones.json");

        let store = JsonFileMetadataStore::open(&path).unwrap();
        assert!(store.list().is_empty());
        store.put(&record("com.example.app_1")).unwrap();
        store.put(&record("com.example.app_2")).unwrap();
        drop(store);

        let store = JsonFileMetadataStore::open(&path).unwrap();
        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], record("com.example.app_1"));
        assert_eq!(store.get("com.example.app_2").unwrap().payload_size_bytes, 5);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileMetadataStore::open(&tmp.path().join("clones.json")).unwrap();
        store.put(&record("a_1")).unwrap();
        store.delete("a_1").unwrap();
        assert!(matches!(store.delete("a_1"), Err(MetadataError::NotFound(_))));
        assert!(matches!(store.get("a_1"), Err(MetadataError::NotFound(_))));
    }

    #[test]
    fn corrupt_document_lists_empty_and_refuses_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clones.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = JsonFileMetadataStore::open(&path).unwrap();
        assert!(store.list().is_empty());
        assert!(store.health_check().is_err());
        assert!(matches!(
            store.put(&record("a_1")),
            Err(MetadataError::Corrupt { .. })
        ));
        // The corrupt bytes are left for inspection.
        assert_eq!(fs::read(&path).unwrap(), b"{ not json");

        store.clear().unwrap();
        store.health_check().unwrap();
        store.put(&record("a_1")).unwrap();
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn unknown_version_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clones.json");
        fs::write(&path, br#"{"version": 9, "clones": []}"#).unwrap();

        let store = JsonFileMetadataStore::open(&path).unwrap();
        assert!(matches!(
            store.get("a_1"),
            Err(MetadataError::Corrupt { .. })
        ));
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("clones.json");
        let store = JsonFileMetadataStore::open(&path).unwrap();
        store.put(&record("a_1")).unwrap();
        store.delete("a_1").unwrap();

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn concurrent_puts_are_all_kept() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileMetadataStore::open(&tmp.path().join("clones.json")).unwrap();

        std::thread::scope(|s| {
            for i in 0..8 {
                let store = &store;
                s.spawn(move || store.put(&record(&format!("a_{i}"))).unwrap());
            }
        });

        assert_eq!(store.list().len(), 8);
    }
}
