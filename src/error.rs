//! Crate-wide error taxonomy.
//!
//! Every failure a caller can act on is a distinct variant.  Insufficient
//! aggregation coverage during propagation is deliberately NOT an error —
//! it stops propagation for the remaining coarser archives and nothing else.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhisperError {
    /// Bad archive set, unknown aggregation method, xFilesFactor out of
    /// range, or a step/retention rule violation.  Raised before any file
    /// mutation.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The file does not parse as a whisper database: size mismatch, an
    /// archive region escaping the file, or an invalid enum code.
    #[error("Corrupt whisper file: {0}")]
    CorruptFile(String),

    /// Update timestamp falls outside every archive's retention window.
    #[error("Timestamp {timestamp} not covered by any archive (max retention {max_retention}s)")]
    TimestampNotCovered { timestamp: u32, max_retention: u32 },

    /// Fetch interval is empty, inverted, or entirely in the future.
    #[error("Invalid fetch interval: {0}")]
    ArchiveBoundary(String),

    /// `create` refused to overwrite an existing database.
    #[error("File already exists: {0}")]
    FileExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, WhisperError>;
