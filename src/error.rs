//! Error types for clone storage operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::clone_id::UnsafeIdentifier;

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("clone not found: {0}")]
    NotFound(String),

    #[error("metadata document {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("metadata I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode metadata: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("metadata lock poisoned")]
    Poisoned,
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

/// Payload copy errors. A copy either completes or fails as a whole.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to open source payload {}: {source}", .path.display())]
    OpenSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {}: {source}", .path.display())]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while copying to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("copied {actual} bytes but the source reported {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("copy cancelled")]
    Cancelled,
}

/// Why a source was refused for cloning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    /// The source is the host application itself.
    SelfClone,
    /// The eligibility policy rejected the identifier.
    Denylisted,
    /// The identifier cannot be used as a directory name.
    UnsafeIdentifier(UnsafeIdentifier),
}

impl std::fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfClone => f.write_str("the host application cannot clone itself"),
            Self::Denylisted => f.write_str("source is not clonable"),
            Self::UnsafeIdentifier(why) => write!(f, "{why}"),
        }
    }
}

/// Clone creation errors.
#[derive(Debug, Error)]
pub enum CloneError {
    #[error("{identifier} is not eligible for cloning: {reason}")]
    Ineligible {
        identifier: String,
        reason: IneligibleReason,
    },

    #[error("storage unavailable at {}: {source}", .path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("copying payload for {clone_id} failed: {source}")]
    CopyFailed {
        clone_id: String,
        #[source]
        source: CopyError,
    },

    #[error("recording clone {clone_id} failed: {source}")]
    MetadataWriteFailed {
        clone_id: String,
        #[source]
        source: MetadataError,
    },
}

impl CloneError {
    /// Whether retrying the same request could succeed.
    ///
    /// Policy rejections and caller cancellations are never retryable; every
    /// environment fault is left to the caller's discretion.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ineligible { .. } => false,
            Self::CopyFailed {
                source: CopyError::Cancelled,
                ..
            } => false,
            Self::StorageUnavailable { .. }
            | Self::CopyFailed { .. }
            | Self::MetadataWriteFailed { .. } => true,
        }
    }
}

/// Clone removal errors.
#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("clone not found: {0}")]
    NotFound(String),

    /// The directory could not be deleted; the record is still listed.
    #[error("removing {} for clone {clone_id} failed: {source}", .path.display())]
    PartialRemoval {
        clone_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata error while removing {clone_id}: {source}")]
    Metadata {
        clone_id: String,
        #[source]
        source: MetadataError,
    },
}

/// Clone rename errors.
#[derive(Debug, Error)]
pub enum RenameError {
    #[error("clone not found: {0}")]
    NotFound(String),

    #[error("display name must not be empty")]
    EmptyName,

    #[error("updating sidecar {} failed: {source}", .path.display())]
    Sidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ineligible_is_not_retryable() {
        let err = CloneError::Ineligible {
            identifier: "com.example.host".to_string(),
            reason: IneligibleReason::SelfClone,
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("cannot clone itself"));
    }

    #[test]
    fn cancelled_copy_is_not_retryable_but_io_is() {
        let cancelled = CloneError::CopyFailed {
            clone_id: "a_1".to_string(),
            source: CopyError::Cancelled,
        };
        assert!(!cancelled.is_retryable());

        let io = CloneError::CopyFailed {
            clone_id: "a_1".to_string(),
            source: CopyError::SizeMismatch {
                expected: 4,
                actual: 2,
            },
        };
        assert!(io.is_retryable());
    }
}
