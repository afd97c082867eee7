//! Error taxonomy for the repository layer

use crate::authz::Access;
use crate::types::Revnum;

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, ReposError>;

/// Errors that can occur in the editor, reporter, commit and dump/load paths
#[derive(Debug, thiserror::Error)]
pub enum ReposError {
    /// A driver broke the editor or reporter calling discipline
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Access denied: {access} access to '{path}'")]
    AccessDenied { path: String, access: Access },

    #[error("Out of date: '{path}' changed in r{changed} after base r{base}")]
    OutOfDate {
        path: String,
        base: Revnum,
        changed: Revnum,
    },

    #[error("Corrupt delta at byte {offset}: {reason}")]
    CorruptDelta { offset: u64, reason: String },

    #[error("Malformed dump stream at byte {offset} (r{revision:?}): {reason}")]
    MalformedStream {
        offset: u64,
        revision: Option<Revnum>,
        reason: String,
    },

    #[error("Report already closed")]
    ReportAlreadyClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Path not found: '{path}' in {root}")]
    NotFound { path: String, root: String },

    #[error("Path already exists: '{0}'")]
    AlreadyExists(String),

    #[error("Not a directory: '{0}'")]
    NotADirectory(String),

    #[error("Not a file: '{0}'")]
    NotAFile(String),

    #[error("No such revision: {0}")]
    NoSuchRevision(Revnum),

    #[error("Transaction not found: {0}")]
    TxnNotFound(String),

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Path '{path}' is locked by '{owner}'")]
    Locked { path: String, owner: String },

    #[error("Hook '{hook}' rejected the operation: {message}")]
    HookFailed { hook: String, message: String },

    #[error("Storage backend error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReposError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ReposError::ProtocolViolation(msg.into())
    }

    pub(crate) fn not_found(path: &str, root: impl std::fmt::Display) -> Self {
        ReposError::NotFound {
            path: path.to_string(),
            root: root.to_string(),
        }
    }

    pub(crate) fn malformed(offset: u64, revision: Option<Revnum>, reason: impl Into<String>) -> Self {
        ReposError::MalformedStream {
            offset,
            revision,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt_delta(offset: u64, reason: impl Into<String>) -> Self {
        ReposError::CorruptDelta {
            offset,
            reason: reason.into(),
        }
    }

    /// True for caller-requested cancellation, which is not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReposError::Cancelled)
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, ReposError::AccessDenied { .. })
    }

    /// True when retrying against a newer base may succeed
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, ReposError::OutOfDate { .. })
    }
}

impl From<bincode::Error> for ReposError {
    fn from(e: bincode::Error) -> Self {
        ReposError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ReposError {
    fn from(e: serde_json::Error) -> Self {
        ReposError::Serialization(e.to_string())
    }
}

impl From<sled::Error> for ReposError {
    fn from(e: sled::Error) -> Self {
        ReposError::Storage(e.to_string())
    }
}
