// File: snapkeep/src/replication/mod.rs
pub mod direct;
pub mod file;
pub mod metadata;

use crate::dataset::{Dataset, Filesystem, Snapshot};
use crate::errors::{Result, SnapkeepError};

/// Resolves the incremental base for a transfer. An explicitly named base
/// must exist on the source; otherwise the newest snapshot already marked
/// replicated for this label is used, and a full send happens when there is
/// none. Selection decides against fresh properties: state may have moved
/// underneath earlier in the same run or concurrently on a remote endpoint.
pub async fn select_base_snapshot(
    source: &Filesystem,
    label: &str,
    explicit: Option<&str>,
) -> Result<Option<Snapshot>> {
    source.host().refresh_cache().await?;

    match explicit {
        Some(short) => match source.snapshot_by_short_name(short).await? {
            Some(snapshot) => Ok(Some(snapshot)),
            None => Err(SnapkeepError::Replication(format!(
                "base snapshot {} not found on {}",
                short,
                source.location()
            ))),
        },
        None => source.latest_replication_snapshot(label).await,
    }
}

/// Argv for an incremental or full replication-stream send of a snapshot.
pub fn send_args(snapshot: &Snapshot, base: Option<&Snapshot>) -> Vec<String> {
    let mut args = vec!["send".to_string(), "-R".to_string()];
    if let Some(base) = base {
        args.push("-I".to_string());
        args.push(format!("@{}", base.short_name()));
    }
    args.push(snapshot.name().to_string());
    args
}

/// Argv for a force-apply receive into a filesystem. The forced rollback is
/// what lets a rerun recover from a transfer killed mid-flight.
pub fn receive_args(destination: &Filesystem) -> Vec<String> {
    vec![
        "receive".to_string(),
        "-F".to_string(),
        "-v".to_string(),
        destination.name().to_string(),
    ]
}
