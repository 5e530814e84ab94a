//! Staged archive import
//!
//! An import never writes to its destination until the staged copy has been
//! verified. Everything happens under a sibling staging path, which is
//! renamed over the destination on success and removed otherwise.
//!
//! ```text
//! Staging ──► Verifying ──► (pre-commit check) ──► Committing ──► Committed
//!    │            │                  │                   │
//!    └── cancel / error / missing blocks / refused ──► RollingBack ──► RolledBack
//! ```
//!
//! The shared side of the GC coordination lock is held for the whole call,
//! so no sweep can remove chunks the staged records reference before they
//! are committed.

use crate::archive::{ArchiveReader, CopyObserver, DDB_DIR, FILES_DIR};
use crate::check::PreCommitCheck;
use crate::error::{ImportError, ImportResult};
use crate::manifest::ImportManifest;
use crate::meta::MetadataStore;
use crate::registry::ImportRegistry;
use crate::transfer::{MetadataTransfer, TransferFactory, TransferReport, TransferRequest};
use dedupio_cluster::GcCoordinationLock;
use dedupio_common::config::VolumeConfig;
use dedupio_common::{EventHandle, EventKind, EventOutcome};
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default replication port
pub const DEFAULT_PORT: u16 = 6442;
/// Default number of blocks requested per round trip
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Phase of an import
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportState {
    Staging,
    Verifying,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

/// Operator request for one import
#[derive(Clone)]
pub struct ImportRequest {
    /// Archive to import
    pub src: PathBuf,
    /// Logical destination in the volume
    pub dest: String,
    /// Replication source to pull missing blocks from
    pub server: String,
    pub password: String,
    pub port: u16,
    pub batch_size: usize,
    pub use_tls: bool,
}

impl ImportRequest {
    pub fn new(src: impl Into<PathBuf>, dest: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            server: server.into(),
            password: String::new(),
            port: DEFAULT_PORT,
            batch_size: DEFAULT_BATCH_SIZE,
            use_tls: false,
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }
}

impl fmt::Debug for ImportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportRequest")
            .field("src", &self.src)
            .field("dest", &self.dest)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("batch_size", &self.batch_size)
            .field("use_tls", &self.use_tls)
            .finish_non_exhaustive()
    }
}

/// One in-flight import, as seen by the running import table
pub struct ImportTransaction {
    id: String,
    src: PathBuf,
    dest: String,
    staging: String,
    state: Mutex<ImportState>,
    cancelled: AtomicBool,
    transfer: Mutex<Option<Arc<dyn MetadataTransfer>>>,
    event: EventHandle,
}

impl ImportTransaction {
    pub fn new(request: &ImportRequest, staging: String, event: EventHandle) -> Self {
        Self {
            id: event.id(),
            src: request.src.clone(),
            dest: request.dest.clone(),
            staging,
            state: Mutex::new(ImportState::Staging),
            cancelled: AtomicBool::new(false),
            transfer: Mutex::new(None),
            event,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn src(&self) -> &Path {
        &self.src
    }

    #[must_use]
    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Logical staging path, a sibling of the destination
    #[must_use]
    pub fn staging(&self) -> &str {
        &self.staging
    }

    pub fn state(&self) -> ImportState {
        *self.state.lock()
    }

    pub fn event(&self) -> &EventHandle {
        &self.event
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Request cancellation. Extraction stops before its next entry and an
    /// attached transfer is closed; the import then rolls back.
    pub fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(transfer) = self.transfer.lock().as_ref() {
            transfer.close();
        }
    }

    fn set_state(&self, state: ImportState) {
        let mut current = self.state.lock();
        debug!("Import {}: {:?} -> {:?}", self.id, *current, state);
        *current = state;
    }

    fn attach_transfer(&self, transfer: Arc<dyn MetadataTransfer>) {
        *self.transfer.lock() = Some(transfer);
    }

    fn check_cancelled(&self) -> ImportResult<()> {
        if self.is_cancelled() {
            Err(ImportError::CancellationRequested)
        } else {
            Ok(())
        }
    }
}

impl CopyObserver for ImportTransaction {
    fn is_cancelled(&self) -> bool {
        Self::is_cancelled(self)
    }

    fn on_copied(&self, bytes: u64) {
        self.event.add_bytes(bytes);
    }
}

/// Best-effort removal of the physical staging path on every exit
struct StagingGuard {
    path: Option<PathBuf>,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else { return };
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else if path.exists() {
            fs::remove_file(&path)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            debug!("Failed to clean up staging path '{}': {}", path.display(), e);
        }
    }
}

/// Imports replicated archives into the local volume
pub struct ArchiveImporter {
    lock: GcCoordinationLock,
    registry: Arc<ImportRegistry>,
    store: Arc<dyn MetadataStore>,
    archive: Arc<dyn ArchiveReader>,
    transfers: Arc<dyn TransferFactory>,
    pre_commit: Option<Arc<dyn PreCommitCheck>>,
    volume: VolumeConfig,
}

impl ArchiveImporter {
    pub fn new(
        lock: GcCoordinationLock,
        registry: Arc<ImportRegistry>,
        store: Arc<dyn MetadataStore>,
        archive: Arc<dyn ArchiveReader>,
        transfers: Arc<dyn TransferFactory>,
        volume: VolumeConfig,
    ) -> Self {
        Self {
            lock,
            registry,
            store,
            archive,
            transfers,
            pre_commit: None,
            volume,
        }
    }

    /// Inspect every verified staged tree with `check` before committing it
    #[must_use]
    pub fn with_pre_commit_check(mut self, check: Arc<dyn PreCommitCheck>) -> Self {
        self.pre_commit = Some(check);
        self
    }

    pub fn registry(&self) -> &Arc<ImportRegistry> {
        &self.registry
    }

    /// Cancel a running import by its event id
    pub fn stop_job(&self, id: &str) -> ImportResult<()> {
        self.registry.cancel(id)
    }

    /// Import `request.src` into `request.dest`.
    ///
    /// `event` ends exactly once: success with the manifest, or an error
    /// carrying the cause. A failure before the commit leaves the destination
    /// as it was.
    /// A duplicate event id is refused without touching `event`, which
    /// belongs to the import already running under that id.
    pub async fn import_archive(
        &self,
        request: ImportRequest,
        event: EventHandle,
    ) -> ImportResult<ImportManifest> {
        if let Err(e) = validate_destination(self.store.as_ref(), &request.dest) {
            error!("Refusing import of {} to '{}': {}", request.src.display(), request.dest, e);
            event.end(EventOutcome::error("import refused", &e));
            return Err(e);
        }

        let _gc = self.lock.acquire_shared().await;

        let staging = format!("{}.{}", request.dest, Uuid::new_v4().simple());
        let tx = Arc::new(ImportTransaction::new(&request, staging, event.clone()));
        let _registration = self.registry.register(Arc::clone(&tx))?;
        let _staging = StagingGuard {
            path: self.store.physical_path(tx.staging()).ok(),
        };

        info!(
            "Importing {} to {} (staging {}) from {}:{}",
            request.src.display(),
            request.dest,
            tx.staging(),
            request.server,
            request.port
        );
        metrics::counter!("dedupio_imports_total").increment(1);

        match self.execute(&tx, &request).await {
            Ok(manifest) => {
                tx.set_state(ImportState::Committed);
                event.end(EventOutcome::success(format!(
                    "imported {} files into {}",
                    manifest.filesimported, manifest.dest
                )));
                info!("Import {} committed to {}", tx.id(), request.dest);
                Ok(manifest)
            }
            Err(e) => {
                metrics::counter!("dedupio_import_failures_total").increment(1);
                tx.set_state(ImportState::RollingBack);
                if let Err(rollback) = self.rollback(tx.staging()) {
                    warn!("{}", rollback);
                }
                tx.set_state(ImportState::RolledBack);
                error!("Import of {} to {} failed: {}", request.src.display(), request.dest, e);
                event.end(EventOutcome::error("import failed", &e));
                Err(e)
            }
        }
    }

    /// Remove a staged subtree, children before their directory. Removing
    /// an already removed subtree does nothing.
    pub fn rollback(&self, staging: &str) -> ImportResult<()> {
        let mut failures = Vec::new();
        self.remove_tree(staging, &mut failures);
        if failures.is_empty() {
            info!("Rolled back {}", staging);
            Ok(())
        } else {
            Err(ImportError::RollbackFailure {
                path: staging.to_string(),
                reason: failures.join("; "),
            })
        }
    }

    fn remove_tree(&self, path: &str, failures: &mut Vec<String>) {
        let entry = match self.store.get(path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                failures.push(format!("{path}: {e}"));
                return;
            }
        };
        if entry.is_directory() {
            match self.store.list(path) {
                Ok(children) => {
                    for child in children {
                        self.remove_tree(&format!("{}/{}", path.trim_end_matches('/'), child), failures);
                    }
                }
                Err(e) => failures.push(format!("{path}: {e}")),
            }
        }
        if let Err(e) = self.store.remove_entry(path, true) {
            failures.push(format!("{path}: {e}"));
        }
    }

    async fn execute(
        &self,
        tx: &Arc<ImportTransaction>,
        request: &ImportRequest,
    ) -> ImportResult<ImportManifest> {
        self.stage(tx).await?;

        tx.set_state(ImportState::Verifying);
        let report = self.verify(tx, request).await?;

        if let Some(check) = &self.pre_commit {
            let staged_dir = self.store.physical_path(tx.staging())?;
            check.check(tx.staging(), &staged_dir, tx.event()).await?;
            tx.check_cancelled()?;
        }

        tx.set_state(ImportState::Committing);
        self.commit(tx)?;

        Ok(self.manifest(request, &report))
    }

    async fn stage(&self, tx: &Arc<ImportTransaction>) -> ImportResult<()> {
        let archive = Arc::clone(&self.archive);
        let tx = Arc::clone(tx);
        let staged_dir = self.store.physical_path(tx.staging())?;
        let ddb_dir = self.volume.dedup_db_dir.clone();

        tokio::task::spawn_blocking(move || {
            stage_archive(archive.as_ref(), &tx, &staged_dir, &ddb_dir)
        })
        .await
        .map_err(|e| ImportError::Io(std::io::Error::other(e)))?
    }

    async fn verify(
        &self,
        tx: &Arc<ImportTransaction>,
        request: &ImportRequest,
    ) -> ImportResult<TransferReport> {
        let transfer_event =
            EventHandle::new(EventKind::MetadataImport, format!("verify {}", tx.staging()));
        let transfer = self.transfers.open(TransferRequest {
            staged_path: tx.staging().to_string(),
            staged_dir: self.store.physical_path(tx.staging())?,
            server: request.server.clone(),
            password: request.password.clone(),
            port: request.port,
            batch_size: request.batch_size,
            use_tls: request.use_tls,
            event: transfer_event.clone(),
        })?;
        tx.attach_transfer(Arc::clone(&transfer));
        tx.check_cancelled()?;

        let result = transfer.run().await;
        tx.event().add_child(transfer_event.snapshot());
        // A closed transfer fails on its own terms; report the cancellation
        tx.check_cancelled()?;
        let report = result?;

        if report.corrupt {
            warn!(
                "Import {} is missing blocks after {} files, rolling back",
                tx.id(),
                report.files_processed
            );
            return Err(ImportError::IncompleteImport {
                dest: tx.dest().to_string(),
            });
        }
        Ok(report)
    }

    fn commit(&self, tx: &ImportTransaction) -> ImportResult<()> {
        let dest = tx.dest();
        let commit_failure = |e: ImportError| ImportError::CommitFailure {
            dest: dest.to_string(),
            reason: e.to_string(),
        };

        if self.store.get(dest).map_err(commit_failure)?.is_some() {
            debug!("Replacing existing entry at {}", dest);
            self.store.remove_entry(dest, true).map_err(commit_failure)?;
        }
        self.store
            .rename_entry(tx.staging(), dest, true)
            .map_err(commit_failure)?;
        // Nothing may remain under the staging name
        self.store
            .remove_entry(tx.staging(), true)
            .map_err(commit_failure)
    }

    fn manifest(&self, request: &ImportRequest, report: &TransferReport) -> ImportManifest {
        ImportManifest {
            src: request.src.display().to_string(),
            dest: request.dest.clone(),
            srcserver: request.server.clone(),
            srcserverport: request.port,
            batchsize: request.batch_size,
            filesimported: report.files_processed,
            bytesimported: report.bytes_transmitted,
            entriesimported: report.entries,
            virtualbytesimported: report.virtual_bytes_transmitted,
            starttime: report.start_time,
            endtime: report.end_time,
            volume: self.volume.name.clone(),
            volumeconfig: self.volume.config_path.display().to_string(),
        }
    }
}

/// A destination must name an entry below the volume root, so that its
/// staging sibling lies outside it
fn validate_destination(store: &dyn MetadataStore, dest: &str) -> ImportResult<()> {
    let relative = dest.trim_start_matches('/');
    if relative.is_empty()
        || relative
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ImportError::InvalidPath(dest.to_string()));
    }
    store.physical_path(dest)?;
    Ok(())
}

/// Copy the archive's file records to `staged_dir` and its dedup database to
/// `ddb_dir`
fn stage_archive(
    archive: &dyn ArchiveReader,
    tx: &ImportTransaction,
    staged_dir: &Path,
    ddb_dir: &Path,
) -> ImportResult<()> {
    let src = tx.src();
    if !archive.exists(src) {
        return Err(ImportError::SourceNotFound(src.to_path_buf()));
    }
    tx.event().set_max_count(archive.subtree_size(src, FILES_DIR)?);

    let Some(root) = archive.list(src, FILES_DIR)?.into_iter().next() else {
        return Err(ImportError::CorruptArchive {
            path: src.to_path_buf(),
            reason: format!("no entries under {FILES_DIR}/"),
        });
    };
    if !archive.list(src, "")?.iter().any(|name| name == DDB_DIR) {
        return Err(ImportError::CorruptArchive {
            path: src.to_path_buf(),
            reason: format!("no {DDB_DIR}/ subtree"),
        });
    }

    tx.check_cancelled()?;
    let file_root = format!("{FILES_DIR}/{root}");
    let copied = archive.copy_subtree(src, &file_root, staged_dir, tx)?;
    debug!("Staged {} bytes of {} into {}", copied, file_root, staged_dir.display());

    fs::create_dir_all(ddb_dir)?;
    archive.copy_subtree(src, DDB_DIR, ddb_dir, tx)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DirectoryArchive;
    use crate::meta::FsMetadataStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Transfer returning a canned report, optionally after a barrier
    struct Canned {
        report: TransferReport,
        barrier: Option<Arc<Barrier>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MetadataTransfer for Canned {
        async fn run(&self) -> ImportResult<TransferReport> {
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(ImportError::Transfer("closed".to_string()));
            }
            Ok(self.report.clone())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct CannedFactory {
        report: TransferReport,
        barrier: Option<Arc<Barrier>>,
        closed: Arc<AtomicBool>,
    }

    impl CannedFactory {
        fn new(report: TransferReport) -> Arc<Self> {
            Arc::new(Self {
                report,
                barrier: None,
                closed: Arc::new(AtomicBool::new(false)),
            })
        }

        fn parked(report: TransferReport, barrier: &Arc<Barrier>) -> Arc<Self> {
            Arc::new(Self {
                report,
                barrier: Some(Arc::clone(barrier)),
                closed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl TransferFactory for CannedFactory {
        fn open(&self, _request: TransferRequest) -> ImportResult<Arc<dyn MetadataTransfer>> {
            Ok(Arc::new(Canned {
                report: self.report.clone(),
                barrier: self.barrier.clone(),
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    /// Archive reader that cancels the import once sizing is done, before
    /// anything is copied
    struct CancelBeforeCopy {
        registry: Arc<ImportRegistry>,
        id: String,
    }

    impl ArchiveReader for CancelBeforeCopy {
        fn exists(&self, archive: &Path) -> bool {
            DirectoryArchive.exists(archive)
        }

        fn list(&self, archive: &Path, subtree: &str) -> ImportResult<Vec<String>> {
            DirectoryArchive.list(archive, subtree)
        }

        fn subtree_size(&self, archive: &Path, subtree: &str) -> ImportResult<u64> {
            self.registry.cancel(&self.id)?;
            DirectoryArchive.subtree_size(archive, subtree)
        }

        fn copy_subtree(
            &self,
            archive: &Path,
            subtree: &str,
            dest: &Path,
            observer: &dyn CopyObserver,
        ) -> ImportResult<u64> {
            DirectoryArchive.copy_subtree(archive, subtree, dest, observer)
        }
    }

    /// Store whose renames always fail, as a commit hitting a full disk would
    struct RenameRefused(FsMetadataStore);

    impl MetadataStore for RenameRefused {
        fn get(&self, path: &str) -> ImportResult<Option<crate::meta::MetadataEntry>> {
            self.0.get(path)
        }

        fn list(&self, path: &str) -> ImportResult<Vec<String>> {
            self.0.list(path)
        }

        fn remove_entry(&self, path: &str, permanent: bool) -> ImportResult<()> {
            self.0.remove_entry(path, permanent)
        }

        fn rename_entry(&self, _from: &str, _to: &str, _permanent: bool) -> ImportResult<()> {
            Err(ImportError::Io(std::io::Error::other("rename refused")))
        }

        fn physical_path(&self, path: &str) -> ImportResult<PathBuf> {
            self.0.physical_path(path)
        }
    }

    /// Records what it saw of the staged tree, then accepts or refuses it
    struct StagedTreeCheck {
        refuse: bool,
        seen: Mutex<Vec<String>>,
    }

    impl StagedTreeCheck {
        fn new(refuse: bool) -> Arc<Self> {
            Arc::new(Self {
                refuse,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PreCommitCheck for StagedTreeCheck {
        async fn check(
            &self,
            staged_path: &str,
            staged_dir: &Path,
            _event: &EventHandle,
        ) -> ImportResult<()> {
            let mut names: Vec<String> = fs::read_dir(staged_dir)?
                .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                .collect::<Result<_, _>>()?;
            names.sort();
            *self.seen.lock() = names;
            if self.refuse {
                return Err(ImportError::CheckFailed {
                    path: staged_path.to_string(),
                    reason: "2 chunks below replica target".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        archive: PathBuf,
        volume: PathBuf,
        store: Arc<FsMetadataStore>,
        lock: GcCoordinationLock,
        registry: Arc<ImportRegistry>,
        config: VolumeConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let archive = dir.path().join("archives/a1");
            fs::create_dir_all(archive.join("files/a1/docs")).unwrap();
            fs::write(archive.join("files/a1/readme"), vec![7u8; 64]).unwrap();
            fs::write(archive.join("files/a1/docs/guide"), vec![7u8; 32]).unwrap();
            fs::create_dir_all(archive.join("ddb/hdb")).unwrap();
            fs::write(archive.join("ddb/hdb/map"), b"hash map").unwrap();

            let volume = dir.path().join("volume/files");
            fs::create_dir_all(volume.join("vol/data/a1")).unwrap();
            fs::write(volume.join("vol/data/a1/previous"), b"old content").unwrap();

            let config = VolumeConfig {
                name: "pool0".to_string(),
                path: volume.clone(),
                config_path: dir.path().join("etc/pool0-volume-cfg.xml"),
                dedup_db_dir: dir.path().join("volume/ddb"),
            };
            Self {
                store: Arc::new(FsMetadataStore::new(&volume)),
                archive,
                volume,
                lock: GcCoordinationLock::new(),
                registry: ImportRegistry::new(),
                config,
                _dir: dir,
            }
        }

        fn importer(
            &self,
            reader: Arc<dyn ArchiveReader>,
            transfers: Arc<dyn TransferFactory>,
        ) -> ArchiveImporter {
            ArchiveImporter::new(
                self.lock.clone(),
                Arc::clone(&self.registry),
                self.store.clone(),
                reader,
                transfers,
                self.config.clone(),
            )
        }

        fn request(&self) -> ImportRequest {
            ImportRequest::new(&self.archive, "/vol/data/a1", "replica-1")
                .with_password("secret")
                .with_batch_size(256)
        }

        fn dest_listing(&self) -> Vec<String> {
            self.store.list("/vol/data/a1").unwrap()
        }

        fn leftover_staging(&self) -> Vec<String> {
            self.store
                .list("/vol/data")
                .unwrap()
                .into_iter()
                .filter(|name| name.starts_with("a1."))
                .collect()
        }
    }

    fn report(corrupt: bool) -> TransferReport {
        TransferReport {
            corrupt,
            files_processed: 120,
            bytes_transmitted: 4_096_000,
            entries: 140,
            virtual_bytes_transmitted: 9_000_000,
            start_time: 1_700_000_000_000,
            end_time: 1_700_000_005_000,
        }
    }

    #[tokio::test]
    async fn test_successful_import_replaces_destination() {
        let fx = Fixture::new();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");

        let manifest = importer.import_archive(fx.request(), event.clone()).await.unwrap();

        assert_eq!(manifest.filesimported, 120);
        assert_eq!(manifest.bytesimported, 4_096_000);
        assert_eq!(manifest.dest, "/vol/data/a1");
        assert_eq!(manifest.srcserver, "replica-1");
        assert_eq!(manifest.batchsize, 256);
        assert_eq!(manifest.volume, "pool0");
        let xml = manifest.to_xml().unwrap();
        assert!(xml.contains(r#"filesimported="120""#));
        assert!(xml.contains(r#"bytesimported="4096000""#));

        assert_eq!(fx.dest_listing(), vec!["docs", "readme"]);
        assert!(fx.leftover_staging().is_empty());
        assert!(fx.config.dedup_db_dir.join("hdb/map").exists());

        let snap = event.snapshot();
        assert!(snap.succeeded());
        assert_eq!(snap.max_count, 96);
        assert_eq!(snap.current_count, 96 + 8);
        assert_eq!(snap.children.len(), 1);
        assert!(fx.registry.is_empty());
        assert!(fx.lock.try_acquire_exclusive().is_some());
    }

    #[tokio::test]
    async fn test_missing_blocks_leave_destination_untouched() {
        let fx = Fixture::new();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(true)));
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");

        let result = importer.import_archive(fx.request(), event.clone()).await;

        assert!(matches!(result, Err(ImportError::IncompleteImport { .. })));
        assert_eq!(fx.dest_listing(), vec!["previous"]);
        assert_eq!(
            fs::read(fx.volume.join("vol/data/a1/previous")).unwrap(),
            b"old content"
        );
        assert!(fx.leftover_staging().is_empty());

        let snap = event.snapshot();
        assert!(snap.done);
        assert!(snap.outcome.as_ref().is_some_and(EventOutcome::is_error));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.volume.join("vol/data/a1.stale/deep/er")).unwrap();
        fs::write(fx.volume.join("vol/data/a1.stale/deep/er/f"), b"x").unwrap();
        fs::write(fx.volume.join("vol/data/a1.stale/g"), b"y").unwrap();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));

        importer.rollback("/vol/data/a1.stale").unwrap();
        let after_first = fx.store.list("/vol/data").unwrap();
        importer.rollback("/vol/data/a1.stale").unwrap();

        assert_eq!(after_first, vec!["a1"]);
        assert_eq!(fx.store.list("/vol/data").unwrap(), after_first);
        assert_eq!(fx.dest_listing(), vec!["previous"]);
    }

    #[tokio::test]
    async fn test_cancel_before_extraction() {
        let fx = Fixture::new();
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");
        let reader = Arc::new(CancelBeforeCopy {
            registry: Arc::clone(&fx.registry),
            id: event.id(),
        });
        let importer = fx.importer(reader, CannedFactory::new(report(false)));

        let result = importer.import_archive(fx.request(), event.clone()).await;

        assert!(matches!(result, Err(ImportError::CancellationRequested)));
        assert_eq!(fx.dest_listing(), vec!["previous"]);
        assert!(fx.leftover_staging().is_empty());
        assert_eq!(event.snapshot().current_count, 0);
        assert!(!event.snapshot().succeeded());
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_source() {
        let fx = Fixture::new();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));
        let request = ImportRequest::new(fx.archive.join("absent"), "/vol/data/a1", "replica-1");

        let result = importer
            .import_archive(request, EventHandle::new(EventKind::ArchiveImport, "import"))
            .await;
        assert!(matches!(result, Err(ImportError::SourceNotFound(_))));
        assert_eq!(fx.dest_listing(), vec!["previous"]);
    }

    #[tokio::test]
    async fn test_archive_without_dedup_db_is_corrupt() {
        let fx = Fixture::new();
        fs::remove_dir_all(fx.archive.join("ddb")).unwrap();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));

        let result = importer
            .import_archive(fx.request(), EventHandle::new(EventKind::ArchiveImport, "import"))
            .await;
        assert!(matches!(result, Err(ImportError::CorruptArchive { .. })));
        assert_eq!(fx.dest_listing(), vec!["previous"]);
    }

    #[tokio::test]
    async fn test_empty_files_are_not_corruption() {
        let fx = Fixture::new();
        fs::write(fx.archive.join("files/a1/readme"), b"").unwrap();
        fs::write(fx.archive.join("files/a1/docs/guide"), b"").unwrap();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));

        importer
            .import_archive(fx.request(), EventHandle::new(EventKind::ArchiveImport, "import"))
            .await
            .unwrap();
        assert_eq!(fx.dest_listing(), vec!["docs", "readme"]);
    }

    #[tokio::test]
    async fn test_concurrent_imports_share_the_lock() {
        let fx = Fixture::new();
        let barrier = Arc::new(Barrier::new(2));
        let importer = Arc::new(fx.importer(
            Arc::new(DirectoryArchive),
            CannedFactory::parked(report(false), &barrier),
        ));

        let first = ImportRequest::new(&fx.archive, "/vol/data/b1", "replica-1");
        let second = ImportRequest::new(&fx.archive, "/vol/other/b2", "replica-2");
        let (a, b) = tokio::time::timeout(
            Duration::from_secs(10),
            async {
                tokio::join!(
                    importer.import_archive(first, EventHandle::new(EventKind::ArchiveImport, "b1")),
                    importer.import_archive(second, EventHandle::new(EventKind::ArchiveImport, "b2")),
                )
            },
        )
        .await
        .unwrap();

        // Both passed the barrier, so both held the shared lock at once
        a.unwrap();
        b.unwrap();
        assert_eq!(fx.store.list("/vol/data/b1").unwrap(), vec!["docs", "readme"]);
        assert_eq!(fx.store.list("/vol/other/b2").unwrap(), vec!["docs", "readme"]);
        assert_eq!(fx.dest_listing(), vec!["previous"]);
    }

    #[tokio::test]
    async fn test_import_blocks_sweep() {
        let fx = Fixture::new();
        let barrier = Arc::new(Barrier::new(2));
        let importer = Arc::new(fx.importer(
            Arc::new(DirectoryArchive),
            CannedFactory::parked(report(false), &barrier),
        ));

        let task = tokio::spawn({
            let importer = Arc::clone(&importer);
            let request = fx.request();
            async move {
                importer
                    .import_archive(request, EventHandle::new(EventKind::ArchiveImport, "a1"))
                    .await
            }
        });

        // The import is parked in verification until the barrier releases it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.registry.len(), 1);
        assert!(fx.lock.try_acquire_exclusive().is_none());

        barrier.wait().await;
        task.await.unwrap().unwrap();
        assert!(fx.lock.try_acquire_exclusive().is_some());
    }

    #[tokio::test]
    async fn test_stop_unknown_job() {
        let fx = Fixture::new();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));
        assert!(matches!(
            importer.stop_job("nope"),
            Err(ImportError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_destinations_are_refused() {
        let fx = Fixture::new();
        let importer = fx.importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)));

        for dest in [
            "",
            "/",
            "///",
            "/vol/data/a1/",
            "/vol//a1",
            "/vol/data/./a1",
            "/vol/data/..",
            "/.trash/a1",
        ] {
            let event = EventHandle::new(EventKind::ArchiveImport, "import");
            let request = ImportRequest::new(&fx.archive, dest, "replica-1");

            let result = importer.import_archive(request, event.clone()).await;

            assert!(
                matches!(result, Err(ImportError::InvalidPath(_))),
                "dest {dest:?} gave {result:?}"
            );
            let snap = event.snapshot();
            assert!(snap.done);
            assert!(snap.outcome.as_ref().is_some_and(EventOutcome::is_error));
            assert!(fx.registry.is_empty());
        }

        // Nothing was staged, replaced or removed
        assert_eq!(fx.store.list("/").unwrap(), vec!["vol"]);
        assert_eq!(fx.store.list("/vol/data").unwrap(), vec!["a1"]);
        assert_eq!(fx.dest_listing(), vec!["previous"]);
        assert!(!fx.config.dedup_db_dir.exists());
    }

    #[tokio::test]
    async fn test_cancel_during_verification() {
        let fx = Fixture::new();
        let barrier = Arc::new(Barrier::new(2));
        let transfers = CannedFactory::parked(report(false), &barrier);
        let importer = Arc::new(fx.importer(Arc::new(DirectoryArchive), transfers.clone()));
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");
        let id = event.id();

        let task = tokio::spawn({
            let importer = Arc::clone(&importer);
            let request = fx.request();
            let event = event.clone();
            async move { importer.import_archive(request, event).await }
        });

        // Wait until the transfer is parked at the barrier
        tokio::time::timeout(Duration::from_secs(10), async {
            while fx.registry.get(&id).map(|tx| tx.state()) != Some(ImportState::Verifying) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        importer.stop_job(&id).unwrap();
        assert!(transfers.closed.load(Ordering::SeqCst));
        barrier.wait().await;

        // The closed transfer fails with its own error, the caller sees the cancel
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ImportError::CancellationRequested)));
        assert_eq!(fx.dest_listing(), vec!["previous"]);
        assert!(fx.leftover_staging().is_empty());

        let snap = event.snapshot();
        assert!(snap.outcome.as_ref().is_some_and(EventOutcome::is_error));
        assert_eq!(snap.children.len(), 1);
        assert!(fx.registry.is_empty());
        assert!(fx.lock.try_acquire_exclusive().is_some());
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_staging() {
        let fx = Fixture::new();
        let importer = ArchiveImporter::new(
            fx.lock.clone(),
            Arc::clone(&fx.registry),
            Arc::new(RenameRefused(FsMetadataStore::new(&fx.volume))),
            Arc::new(DirectoryArchive),
            CannedFactory::new(report(false)),
            fx.config.clone(),
        );
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");

        let result = importer.import_archive(fx.request(), event.clone()).await;

        match result {
            Err(ImportError::CommitFailure { dest, reason }) => {
                assert_eq!(dest, "/vol/data/a1");
                assert!(reason.contains("rename refused"), "{reason}");
            }
            other => panic!("expected a commit failure, got {other:?}"),
        }
        assert!(fx.leftover_staging().is_empty());
        let snap = event.snapshot();
        assert!(snap.done);
        assert!(snap.outcome.as_ref().is_some_and(EventOutcome::is_error));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_pre_commit_check_sees_staged_tree() {
        let fx = Fixture::new();
        let check = StagedTreeCheck::new(false);
        let importer = fx
            .importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)))
            .with_pre_commit_check(check.clone());

        importer
            .import_archive(fx.request(), EventHandle::new(EventKind::ArchiveImport, "import"))
            .await
            .unwrap();

        assert_eq!(*check.seen.lock(), vec!["docs", "readme"]);
        assert_eq!(fx.dest_listing(), vec!["docs", "readme"]);
    }

    #[tokio::test]
    async fn test_refused_pre_commit_check_rolls_back() {
        let fx = Fixture::new();
        let check = StagedTreeCheck::new(true);
        let importer = fx
            .importer(Arc::new(DirectoryArchive), CannedFactory::new(report(false)))
            .with_pre_commit_check(check.clone());
        let event = EventHandle::new(EventKind::ArchiveImport, "import a1");

        let result = importer.import_archive(fx.request(), event.clone()).await;

        assert!(matches!(result, Err(ImportError::CheckFailed { .. })));
        assert_eq!(*check.seen.lock(), vec!["docs", "readme"]);
        assert_eq!(fx.dest_listing(), vec!["previous"]);
        assert!(fx.leftover_staging().is_empty());
        assert!(event.snapshot().outcome.as_ref().is_some_and(EventOutcome::is_error));
    }
}
