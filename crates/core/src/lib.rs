//! Core domain types for the Archivist backup daemon.
//!
//! This crate defines the data model shared by the storage and daemon crates:
//! - WAL segment identifiers and their sequence relationships
//! - Basebackup records parsed from object metadata
//! - Work items flowing through the compression and transfer queues
//! - Configuration for sites, workers and the control loop
//! - Local and remote path layout per site

pub mod basebackup;
pub mod config;
pub mod error;
pub mod layout;
pub mod wal;
pub mod work;

pub use basebackup::BasebackupRecord;
pub use error::{Error, Result};
pub use wal::SegmentId;
pub use work::{CompletionSender, WorkItem, WorkKind, report_completion};

/// Metadata key holding a basebackup's start time (RFC 3339).
pub const META_START_TIME: &str = "start-time";

/// Metadata key holding the first WAL segment a basebackup needs.
pub const META_START_WAL_SEGMENT: &str = "start-wal-segment";

/// Metadata key recording the compression applied before upload.
pub const META_COMPRESSION: &str = "compression-algorithm";

/// Metadata key recording the uncompressed size of an uploaded file.
pub const META_ORIGINAL_SIZE: &str = "original-file-size";
