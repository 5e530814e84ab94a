//! Pre-commit inspection of a staged import
//!
//! When chunks live on remote storage nodes rather than in a local chunk
//! store, the staged tree has to be checked against the cluster before it
//! may replace the destination. The importer runs such a check after
//! verification and before the commit; a failure rolls the import back.

use crate::error::ImportResult;
use async_trait::async_trait;
use dedupio_common::EventHandle;
use std::path::Path;

/// Inspects a verified staged tree before it is committed
#[async_trait]
pub trait PreCommitCheck: Send + Sync {
    /// `staged_path` is the logical staging path, `staged_dir` its location
    /// on disk. Progress may be reported through `event`.
    async fn check(
        &self,
        staged_path: &str,
        staged_dir: &Path,
        event: &EventHandle,
    ) -> ImportResult<()>;
}
