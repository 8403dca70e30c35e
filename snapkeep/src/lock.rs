// File: snapkeep/src/lock.rs
//! Serializes policy executions against a shared lock file.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::{LOCK_POLL_SECONDS, LOCK_TIMEOUT_SECONDS};
use crate::errors::{Result, SnapkeepError};

/// An advisory file lock held for the lifetime of the value; released when
/// dropped. Acquisition polls with a bounded overall timeout, and failing to
/// acquire within it is fatal to the run.
pub struct RunLock {
    _file: File,
}

impl RunLock {
    pub async fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                SnapkeepError::Lock(format!("cannot open lock file {}: {}", path.display(), e))
            })?;

        let mut remaining = LOCK_TIMEOUT_SECONDS;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Lock acquired");
                    return Ok(Self { _file: file });
                }
                Err(_) if remaining >= LOCK_POLL_SECONDS => {
                    info!(
                        "snapkeep is already running; waiting for lock release... (timeout: {}s)",
                        remaining
                    );
                    tokio::time::sleep(Duration::from_secs(LOCK_POLL_SECONDS)).await;
                    remaining -= LOCK_POLL_SECONDS;
                }
                Err(_) => {
                    return Err(SnapkeepError::Lock(
                        "timeout reached while waiting for the run lock".to_string(),
                    ))
                }
            }
        }
    }
}
