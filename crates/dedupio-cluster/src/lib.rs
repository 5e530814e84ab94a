//! dedupio Cluster - group coordination for garbage collection
//!
//! This crate implements the cross-node side of chunk garbage collection:
//!
//! - **GroupTransport**: request/response broadcast contract, plus an
//!   in-process [`LocalGroup`] implementation
//! - **ClusterDirectory**: membership snapshots, volume lookup, named locks
//! - **GcCoordinationLock**: keeps sweeps and imports from overlapping
//! - **ChunkRemovalBroadcast**: cluster-wide "remove chunks older than T"
//! - **GarbageCollector / GcScheduler**: the sweep entry point and its
//!   cron trigger
//!
//! # Architecture
//!
//! ```text
//! GcScheduler ──► GarbageCollector::run_sweep
//!                    │  (GcCoordinationLock, exclusive)
//!                    ▼
//!              ChunkRemovalBroadcast ──cast──► every member
//!                                               │
//!                                  CommandRegistry ─► RemoveChunksHandler
//!                                                       └─► ChunkSweeper
//! ```

pub mod command;
pub mod directory;
pub mod error;
pub mod gc;
pub mod gc_lock;
pub mod local;
pub mod removal;
pub mod sweeper;
pub mod transport;

pub use command::{ClusterCommand, CommandHandler, CommandRegistry, RemoveChunksCommand};
pub use directory::{ClusterDirectory, GroupDirectory};
pub use error::{ClusterError, ClusterResult};
pub use gc::{GarbageCollector, GcScheduler, SweepPolicy};
pub use gc_lock::{GcCoordinationLock, ImportGuard, SweepGuard};
pub use local::{LocalEndpoint, LocalGroup};
pub use removal::{ChunkRemovalBroadcast, RemovalRequest, RemoveChunksHandler};
pub use sweeper::{ChunkSweeper, DirectoryChunkSweeper};
pub use transport::{GroupTransport, PeerResponse, RequestOptions, ResponseMode, ResponseOutcome};
