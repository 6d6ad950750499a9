//! Streaming payload copy.
//!
//! [`StreamCopier`] writes into `<dest>.partial` and only renames onto the
//! final name once every byte has been written and synced, so a file named
//! `payload` is always complete.

use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::CopyError;

/// Default chunk size for streamed copies.
pub const DEFAULT_BUFFER_BYTES: usize = 1024 * 1024;
pub const MIN_BUFFER_BYTES: usize = 4 * 1024;
pub const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Shared cancellation flag, checked before every chunk.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub bytes: u64,
    /// Hex sha256 of the copied bytes.
    pub sha256: String,
}

/// Copies a source payload to a destination path, all or nothing.
pub trait PayloadCopier: Send + Sync {
    fn copy(&self, src: &Path, dest: &Path, cancel: &CancelToken)
        -> Result<CopyOutcome, CopyError>;
}

/// Buffered byte-for-byte copier.
#[derive(Debug, Clone)]
pub struct StreamCopier {
    buffer_bytes: usize,
}

impl Default for StreamCopier {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_BYTES)
    }
}

impl StreamCopier {
    /// Buffer size is clamped to [`MIN_BUFFER_BYTES`]..=[`MAX_BUFFER_BYTES`].
    pub fn new(buffer_bytes: usize) -> Self {
        Self {
            buffer_bytes: buffer_bytes.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES),
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Stream `reader` into `<dest>.partial`, then rename onto `dest`.
    /// `expected` is the byte count the source claimed up front.
    pub(crate) fn copy_from<R: Read>(
        &self,
        reader: R,
        expected: u64,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<CopyOutcome, CopyError> {
        let tmp = partial_path(dest);
        let outcome = match self.stream(reader, expected, &tmp, cancel) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(source) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(CopyError::Io {
                path: dest.to_path_buf(),
                source,
            });
        }
        Ok(outcome)
    }

    fn stream<R: Read>(
        &self,
        mut reader: R,
        expected: u64,
        tmp: &Path,
        cancel: &CancelToken,
    ) -> Result<CopyOutcome, CopyError> {
        let mut writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)
            .map_err(|source| CopyError::CreateDestination {
                path: tmp.to_path_buf(),
                source,
            })?;

        let io_err = |source| CopyError::Io {
            path: tmp.to_path_buf(),
            source,
        };
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.buffer_bytes];
        let mut copied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(e)),
            };
            writer.write_all(&buf[..n]).map_err(io_err)?;
            hasher.update(&buf[..n]);
            copied += n as u64;
        }
        writer.flush().map_err(io_err)?;
        writer.sync_all().map_err(io_err)?;

        if copied != expected {
            return Err(CopyError::SizeMismatch {
                expected,
                actual: copied,
            });
        }
        Ok(CopyOutcome {
            bytes: copied,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }
}

impl PayloadCopier for StreamCopier {
    fn copy(
        &self,
        src: &Path,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<CopyOutcome, CopyError> {
        let open_err = |source| CopyError::OpenSource {
            path: src.to_path_buf(),
            source,
        };
        let reader = File::open(src).map_err(open_err)?;
        let expected = reader.metadata().map_err(open_err)?.len();
        self.copy_from(reader, expected, dest, cancel)
    }
}

/// `<dest>.partial`, the in-progress name for `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}
