//! Data types shared by the store components.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// An installed application that may be cloned.
///
/// Supplied by a [`SourceInventory`](crate::inventory::SourceInventory); the
/// store never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceArtifact {
    /// Stable unique identifier, typically a reverse-domain name.
    pub identifier: String,
    pub display_name: String,
    #[serde(default)]
    pub version_label: String,
    #[serde(default)]
    pub is_protected: bool,
    /// The binary payload that gets duplicated.
    pub payload_path: PathBuf,
}

/// Persisted metadata describing one clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRecord {
    pub clone_id: String,
    /// Identifier of the source the clone was made from. The source may have
    /// been uninstalled since.
    pub source_identifier: String,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub payload_size_bytes: u64,
    /// Absolute path of the clone directory, owned by this record alone.
    pub storage_path: PathBuf,
    /// Hex sha256 of the payload. Absent for clones recovered from a
    /// directory that had no sidecar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
}

impl CloneRecord {
    /// Path of the payload file inside the clone directory.
    pub fn payload_path(&self) -> PathBuf {
        self.storage_path.join(PAYLOAD_FILENAME)
    }
}

/// Name of the payload file inside every clone directory.
pub const PAYLOAD_FILENAME: &str = "payload";

/// Name of the identity sidecar inside every clone directory.
pub const SIDECAR_FILENAME: &str = "clone.json";

/// Identity stored next to the payload so a clone directory can be adopted
/// without relying on its name alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSidecar {
    pub clone_id: String,
    pub source_identifier: String,
    pub display_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub payload_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
}

impl CloneSidecar {
    /// Read the sidecar of a clone directory. `Ok(None)` when there is none.
    pub fn read_from(clone_dir: &Path) -> std::io::Result<Option<Self>> {
        let path = clone_dir.join(SIDECAR_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
    }

    /// Write the sidecar atomically (temp file + rename).
    pub fn write_to(&self, clone_dir: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
        let tmp = clone_dir.join(format!(".{SIDECAR_FILENAME}.tmp"));
        let written = File::create(&tmp).and_then(|mut f| {
            f.write_all(&bytes)?;
            f.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp, clone_dir.join(SIDECAR_FILENAME))) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
}

impl From<&CloneRecord> for CloneSidecar {
    fn from(record: &CloneRecord) -> Self {
        Self {
            clone_id: record.clone_id.clone(),
            source_identifier: record.source_identifier.clone(),
            display_name: record.display_name.clone(),
            created_at: record.created_at,
            payload_size_bytes: record.payload_size_bytes,
            payload_sha256: record.payload_sha256.clone(),
        }
    }
}
