//! Metadata transfer contract
//!
//! After the archive is staged, a transfer walks the staged records and
//! pulls every block they reference from the replication source. Its report
//! decides whether the import may commit.

use crate::error::{ImportError, ImportResult};
use async_trait::async_trait;
use chrono::Utc;
use dedupio_common::EventHandle;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Everything a transfer needs to pull blocks for a staged tree
#[derive(Clone)]
pub struct TransferRequest {
    /// Logical path of the staged tree
    pub staged_path: String,
    /// Physical location of the staged tree
    pub staged_dir: PathBuf,
    /// Replication source
    pub server: String,
    pub password: String,
    pub port: u16,
    /// Blocks requested per round trip
    pub batch_size: usize,
    pub use_tls: bool,
    /// Event owned by the transfer
    pub event: EventHandle,
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("staged_path", &self.staged_path)
            .field("staged_dir", &self.staged_dir)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("batch_size", &self.batch_size)
            .field("use_tls", &self.use_tls)
            .finish_non_exhaustive()
    }
}

/// Outcome of a finished transfer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Some referenced blocks could not be retrieved
    pub corrupt: bool,
    pub files_processed: u64,
    pub bytes_transmitted: u64,
    pub entries: u64,
    /// Logical size of the imported files
    pub virtual_bytes_transmitted: u64,
    /// Epoch millis
    pub start_time: i64,
    /// Epoch millis
    pub end_time: i64,
}

/// One running transfer
#[async_trait]
pub trait MetadataTransfer: Send + Sync {
    async fn run(&self) -> ImportResult<TransferReport>;

    /// Abort an in-flight transfer; `run` then fails
    fn close(&self);
}

/// Opens transfers for staged imports
pub trait TransferFactory: Send + Sync {
    fn open(&self, request: TransferRequest) -> ImportResult<Arc<dyn MetadataTransfer>>;
}

/// Opens [`ScanTransfer`]s
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanTransferFactory;

impl TransferFactory for ScanTransferFactory {
    fn open(&self, request: TransferRequest) -> ImportResult<Arc<dyn MetadataTransfer>> {
        Ok(Arc::new(ScanTransfer::new(request)))
    }
}

/// Transfer for a source whose blocks are already in the local chunk store,
/// such as a replica seeded on the same site. Nothing is pulled; the staged
/// tree is walked and accounted for.
pub struct ScanTransfer {
    request: TransferRequest,
    closed: Arc<AtomicBool>,
}

impl ScanTransfer {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            request,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl MetadataTransfer for ScanTransfer {
    async fn run(&self) -> ImportResult<TransferReport> {
        let root = self.request.staged_dir.clone();
        let closed = Arc::clone(&self.closed);
        let event = self.request.event.clone();
        info!(
            "Scanning staged tree {} from {}:{}",
            self.request.staged_path, self.request.server, self.request.port
        );

        tokio::task::spawn_blocking(move || {
            let mut report = TransferReport {
                start_time: Utc::now().timestamp_millis(),
                ..TransferReport::default()
            };
            for entry in WalkDir::new(&root).min_depth(1) {
                if closed.load(Ordering::SeqCst) {
                    return Err(ImportError::CancellationRequested);
                }
                let entry = entry.map_err(|e| ImportError::Io(e.into()))?;
                report.entries += 1;
                if entry.file_type().is_file() {
                    let len = entry.metadata().map_err(|e| ImportError::Io(e.into()))?.len();
                    report.files_processed += 1;
                    report.virtual_bytes_transmitted += len;
                    event.add_actions(1);
                }
            }
            report.end_time = Utc::now().timestamp_millis();
            debug!("Scan finished: {:?}", report);
            Ok(report)
        })
        .await
        .map_err(|e| ImportError::Transfer(e.to_string()))?
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
