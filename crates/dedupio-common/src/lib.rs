//! dedupio Common - Shared types and utilities
//!
//! This crate provides the cluster identity types, the progress event model
//! shared between nodes, configuration and the common error definitions.

pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventHandle, EventKind, EventOutcome, ProgressEvent};
pub use types::*;
