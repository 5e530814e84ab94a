//! Import error types

use std::path::PathBuf;
use thiserror::Error;

/// Archive import error
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("source archive not found: {0}")]
    SourceNotFound(PathBuf),

    /// The archive lacks its file entries or its dedup database
    #[error("corrupt archive {path}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    /// Verification found blocks that could not be retrieved
    #[error("incomplete import into {dest}: missing blocks")]
    IncompleteImport { dest: String },

    #[error("import cancelled")]
    CancellationRequested,

    #[error("commit to {dest} failed: {reason}")]
    CommitFailure { dest: String, reason: String },

    /// Logged by the importer, never returned in place of the failure that
    /// triggered the rollback
    #[error("rollback of {path} failed: {reason}")]
    RollbackFailure { path: String, reason: String },

    #[error("no running import with id {0}")]
    JobNotFound(String),

    #[error("an import with id {0} is already running")]
    DuplicateJob(String),

    /// The staged tree was refused before it could replace the destination
    #[error("pre-commit check of {path} failed: {reason}")]
    CheckFailed { path: String, reason: String },

    /// The metadata transfer failed for a reason other than missing blocks
    #[error("metadata transfer failed: {0}")]
    Transfer(String),

    #[error("invalid metadata path: {0}")]
    InvalidPath(String),

    #[error("manifest serialization failed: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for import operations
pub type ImportResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ImportError::IncompleteImport {
            dest: "/vol/data/a1".to_string(),
        };
        assert_eq!(err.to_string(), "incomplete import into /vol/data/a1: missing blocks");
        assert_eq!(
            ImportError::JobNotFound("42".to_string()).to_string(),
            "no running import with id 42"
        );
    }
}
