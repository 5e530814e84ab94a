//! dedupio Replication - staged import of replicated archives
//!
//! An archive produced by a replication source is imported in three phases:
//! its file records are staged next to the destination, a metadata transfer
//! pulls the blocks they reference, an optional pre-commit check inspects
//! the result, and the staged tree is renamed over the destination. A failure in any phase rolls the staged tree back.
//!
//! Imports hold the shared side of the GC coordination lock, so chunk
//! removal waits until every running import has committed or rolled back.

pub mod archive;
pub mod check;
pub mod error;
pub mod import;
pub mod manifest;
pub mod meta;
pub mod registry;
pub mod transfer;

pub use archive::{ArchiveReader, CopyObserver, DirectoryArchive};
pub use check::PreCommitCheck;
pub use error::{ImportError, ImportResult};
pub use import::{ArchiveImporter, ImportRequest, ImportState, ImportTransaction};
pub use manifest::ImportManifest;
pub use meta::{FsMetadataStore, MetadataEntry, MetadataStore};
pub use registry::{ImportRegistry, Registration};
pub use transfer::{
    MetadataTransfer, ScanTransfer, ScanTransferFactory, TransferFactory, TransferReport,
    TransferRequest,
};
