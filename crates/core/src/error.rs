//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid WAL segment name: {0}")]
    InvalidWalSegment(String),

    #[error("invalid basebackup metadata for {name}: {reason}")]
    InvalidBasebackup { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
