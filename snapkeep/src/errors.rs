// File: snapkeep/src/errors.rs
//! Error taxonomy for a policy run.
//!
//! Every failure kind maps to a distinct, stable process exit status so that
//! wrapping automation (cron wrappers, monitoring checks) can tell apart a
//! configuration mistake from a transfer that simply has not arrived yet.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapkeepError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    /// A declared segment file has not arrived yet. Retryable; the unit is
    /// left untouched for a future run.
    #[error("Segment missing: {0}")]
    SegmentMissing(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("snapkeep aborted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, SnapkeepError>;

impl SnapkeepError {
    /// Process exit status surfaced to the invoking shell.
    pub fn exit_code(&self) -> i32 {
        match self {
            SnapkeepError::Lock(_) => 10,
            SnapkeepError::Replication(_) => 11,
            SnapkeepError::Host(_) => 12,
            SnapkeepError::Snapshot(_) => 13,
            SnapkeepError::Config(_) => 14,
            SnapkeepError::Metadata(_) => 15,
            SnapkeepError::SegmentMissing(_) => 16,
            SnapkeepError::Interrupted => 130,
        }
    }
}
