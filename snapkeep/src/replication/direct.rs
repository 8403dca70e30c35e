// File: snapkeep/src/replication/direct.rs
//! Streams an incremental or full snapshot from a source filesystem into a
//! destination filesystem through a live pipe.

use tracing::{info, warn};

use crate::dataset::{Dataset, Filesystem};
use crate::errors::Result;
use crate::host::run_pipeline;
use crate::replication::{receive_args, select_base_snapshot, send_args};

pub async fn replicate(
    source: &Filesystem,
    destination: &Filesystem,
    label: &str,
    base_override: Option<&str>,
    readonly: Option<bool>,
) -> Result<()> {
    info!(
        "Replicating {} to {}",
        source.location(),
        destination.location()
    );

    let base = select_base_snapshot(source, label, base_override).await?;
    match &base {
        Some(base) => info!("Using incremental base {}", base.name()),
        None => info!("No replicated base snapshot found; sending a full stream"),
    }

    let snapshot = source.create_snapshot(label, true).await?;

    let send_cmd = source.host().command("zfs", send_args(&snapshot, base.as_ref()))?;
    let receive_cmd = destination
        .host()
        .command("zfs", receive_args(destination))?;
    run_pipeline(send_cmd, receive_cmd).await?;

    snapshot.mark_replicated().await?;

    // The same snapshot now exists on the destination. Mark it there too so
    // a chained topology can use it as its own incremental base. The
    // destination cache predates the receive, hence the forced refresh.
    destination.host().refresh_cache().await?;
    match destination
        .snapshot_by_short_name(snapshot.short_name())
        .await?
    {
        Some(destination_snapshot) => destination_snapshot.mark_replicated().await?,
        None => warn!(
            "Snapshot {} is not visible on {} after receive",
            snapshot.short_name(),
            destination.location()
        ),
    }

    if let Some(readonly) = readonly {
        destination.set_readonly(readonly).await?;
    }

    info!("Replication of {} completed", source.location());
    Ok(())
}
