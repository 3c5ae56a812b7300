//! Error types shared by the migration pipeline.

use crate::model::Checksum;
use std::io;
use thiserror::Error;

/// Failures reported by an [`ObjectStore`](crate::store::ObjectStore) adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what}: not found")]
    NotFound { what: String },

    /// Network, timeout, throttling or server-side failure worth retrying.
    #[error("{what}: transient failure: {message}")]
    Transient { what: String, message: String },

    /// The store understood the request and refused it.
    #[error("{what}: {message}")]
    Rejected { what: String, message: String },

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn transient(what: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Transient {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn rejected(what: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Rejected {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn io(what: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            what: what.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Why a single object (or a whole tenant) could not be migrated.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("checksum mismatch on {what}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        what: String,
        expected: Checksum,
        actual: Checksum,
    },

    #[error("size mismatch on {what}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error("{what} still failing after {attempts} attempts: {source}")]
    RetriesExhausted {
        what: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Destination container already carries data migrated from another region.
    #[error(
        "container `{container}` at destination was migrated from region `{found}`, refusing to merge data from `{expected}`"
    )]
    Collision {
        container: String,
        expected: String,
        found: String,
    },

    /// Local staging ran out of space; the worker cannot continue.
    #[error("staging area exhausted while staging {what}: {source}")]
    StagingExhausted {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("staging {what}: {source}")]
    Staging {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CopyError {
    /// Wraps a local staging I/O error, singling out a full disk.
    pub fn staging(what: impl Into<String>, source: io::Error) -> Self {
        let what = what.into();
        if source.kind() == io::ErrorKind::StorageFull {
            CopyError::StagingExhausted { what, source }
        } else {
            CopyError::Staging { what, source }
        }
    }

    /// Precondition violations stop the current tenant.
    pub fn halts_tenant(&self) -> bool {
        matches!(self, CopyError::Collision { .. })
    }

    /// Resource exhaustion stops the whole worker.
    pub fn halts_worker(&self) -> bool {
        matches!(self, CopyError::StagingExhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum DuplicateError {
    #[error("tenant `{tenant}` still has duplicate containers after rename: {names:?}")]
    Unresolved { tenant: String, names: Vec<String> },

    #[error(
        "copy of {container}/{object} to `{target}` does not match the original (expected {expected}, found {actual})"
    )]
    CopyMismatch {
        container: String,
        object: String,
        target: String,
        expected: Checksum,
        actual: Checksum,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
