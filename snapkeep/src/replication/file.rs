// File: snapkeep/src/replication/file.rs
//! File-mediated replication for disconnected transports.
//!
//! The sender cuts a send stream into size-bounded segment files plus a
//! checksummed metadata descriptor; the receiver validates, reassembles and
//! applies such units in timestamp order. Segment and metadata files are the
//! only shared state between the two sides.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::constants::VERSION;
use crate::dataset::{Dataset, Filesystem};
use crate::errors::{Result, SnapkeepError};
use crate::host::run_pipeline;
use crate::replication::metadata::{compare_versions, MetadataFile};
use crate::replication::{receive_args, select_base_snapshot, send_args};

fn creating_file_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"creating file [`']([^']+)'").expect("static pattern"))
}

/// Splits a send stream into segment files under `dir` and describes them
/// with a metadata descriptor. The source snapshot is marked replicated only
/// once the descriptor is durably written: a reader must never observe a
/// success marker without a fully materialized unit on disk.
pub async fn send_to_file(
    source: &Filesystem,
    label: &str,
    dir: &Path,
    file_prefix: &str,
    suffix_length: u32,
    split_size: &str,
    base_override: Option<&str>,
) -> Result<()> {
    info!(
        "Replicating {} to segment files in {}",
        source.location(),
        dir.display()
    );

    let base = select_base_snapshot(source, label, base_override).await?;
    match &base {
        Some(base) => info!("Using incremental base {}", base.name()),
        None => info!("No replicated base snapshot found; sending a full stream"),
    }

    let snapshot = source.create_snapshot(label, true).await?;
    let timestamp = snapshot.timestamp_str().to_string();
    let segment_prefix = dir.join(format!("{}_{}-", file_prefix, timestamp));

    let send_cmd = source.host().command("zfs", send_args(&snapshot, base.as_ref()))?;
    let split_cmd = source.host().command_local(
        "split",
        vec![
            "--verbose".to_string(),
            "-a".to_string(),
            suffix_length.to_string(),
            "-b".to_string(),
            split_size.to_string(),
            "-".to_string(),
            segment_prefix.to_string_lossy().into_owned(),
        ],
    )?;
    let output = run_pipeline(send_cmd, split_cmd).await?;

    // The splitter announces every segment it creates; rely on those
    // announcements rather than assuming a count.
    let segments = parse_split_output(&output)?;
    info!("Split stream into {} segment(s)", segments.len());

    let mut metadata = MetadataFile::new(dir.join(format!("{}_{}.json", file_prefix, timestamp)));
    metadata.set_label(label)?;
    metadata.set_snapshot(snapshot.short_name())?;
    metadata.set_version(VERSION)?;
    metadata.set_timestamp(&timestamp)?;
    if let Some(base) = &base {
        metadata.set_depends_on(base.short_name())?;
    }
    metadata.set_segments(segments)?;
    metadata.write().await?;

    snapshot.mark_replicated().await?;
    info!("Replication of {} completed", source.location());
    Ok(())
}

fn parse_split_output(lines: &[String]) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    for line in lines {
        if let Some(capture) = creating_file_pattern().captures(line) {
            let path = PathBuf::from(&capture[1]);
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SnapkeepError::Replication(format!(
                        "splitter announced an unusable file name: {}",
                        line
                    ))
                })?;
            segments.push(name);
        }
    }
    if segments.is_empty() {
        return Err(SnapkeepError::Replication(
            "the splitter announced no output segments".to_string(),
        ));
    }
    Ok(segments)
}

/// Applies every pending transfer unit for this label found in `dir`, in
/// ascending timestamp order. A unit with missing segments stops the run;
/// later units depend on it.
pub async fn receive_from_file(
    destination: &Filesystem,
    label: &str,
    dir: &Path,
    file_prefix: &str,
    readonly: Option<bool>,
) -> Result<()> {
    let units = discover_units(dir, file_prefix, label).await?;
    if units.is_empty() {
        info!(
            "No pending transfer units for label '{}' in {}",
            label,
            dir.display()
        );
        return Ok(());
    }

    for unit in &units {
        apply_unit(destination, label, dir, unit, readonly).await?;
    }
    Ok(())
}

/// Enumerates and validates metadata descriptors under `dir`. Units for a
/// different label are skipped; a unit produced by a newer version than this
/// build rejects the run before any processing.
async fn discover_units(dir: &Path, file_prefix: &str, label: &str) -> Result<Vec<MetadataFile>> {
    let pattern = dir
        .join(format!("{}_*.json", file_prefix))
        .to_string_lossy()
        .into_owned();
    let paths = glob::glob(&pattern)
        .map_err(|e| SnapkeepError::Replication(format!("invalid unit pattern: {}", e)))?;

    let mut units = Vec::new();
    for entry in paths {
        let path = entry
            .map_err(|e| SnapkeepError::Replication(format!("cannot inspect transfer dir: {}", e)))?;
        let unit = MetadataFile::read(&path).await?;

        match unit.label() {
            Some(unit_label) if unit_label == label => {}
            _ => {
                // The directory may be shared by multiple policies.
                warn!(
                    "Skipping {}: label {:?} does not belong to this policy",
                    path.display(),
                    unit.label()
                );
                continue;
            }
        }

        let version = unit.version().ok_or_else(|| {
            SnapkeepError::Metadata(format!("{} carries no version", path.display()))
        })?;
        if compare_versions(version, VERSION)? == std::cmp::Ordering::Greater {
            return Err(SnapkeepError::Replication(format!(
                "{} was produced by version {} which is newer than this build ({})",
                path.display(),
                version,
                VERSION
            )));
        }

        units.push(unit);
    }

    units.sort_by_key(|unit| unit.datetime().unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC));
    Ok(units)
}

async fn apply_unit(
    destination: &Filesystem,
    label: &str,
    dir: &Path,
    unit: &MetadataFile,
    readonly: Option<bool>,
) -> Result<()> {
    let unit_time = unit.datetime()?;
    let snapshot_name = unit.snapshot_name()?;

    // Earlier units applied in this run changed destination state; decide
    // against fresh properties.
    destination.host().refresh_cache().await?;
    let latest = destination.latest_replication_snapshot(label).await?;

    if let Some(latest) = &latest {
        if latest.created_at() >= unit_time {
            info!(
                "Unit {} is already applied or superseded by {}; cleaning up",
                unit.path().display(),
                latest.name()
            );
            delete_unit_files(dir, unit).await;
            return Ok(());
        }
    }

    if let Some(depends_on) = unit.depends_on() {
        if destination
            .snapshot_by_short_name(depends_on)
            .await?
            .is_none()
        {
            return Err(SnapkeepError::Replication(format!(
                "unit {} depends on snapshot {} which does not exist on {}",
                unit.path().display(),
                depends_on,
                destination.location()
            )));
        }
    }

    let mut segment_paths: Vec<PathBuf> = unit.segments().iter().map(|s| dir.join(s)).collect();
    segment_paths.sort();
    for segment in &segment_paths {
        if tokio::fs::metadata(segment).await.is_err() {
            return Err(SnapkeepError::SegmentMissing(format!(
                "segment {} declared by {} has not arrived yet",
                segment.display(),
                unit.path().display()
            )));
        }
    }

    info!(
        "Applying unit {} ({} segment(s)) to {}",
        unit.path().display(),
        segment_paths.len(),
        destination.location()
    );
    let cat_cmd = destination.host().command_local(
        "cat",
        segment_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    )?;
    let receive_cmd = destination
        .host()
        .command("zfs", receive_args(destination))?;
    run_pipeline(cat_cmd, receive_cmd).await?;

    destination.host().refresh_cache().await?;
    match destination.snapshot_by_short_name(snapshot_name).await? {
        Some(snapshot) => {
            // Transports do not always propagate custom properties on the
            // very first synchronization; carry them over from the unit.
            if let Some(unit_label) = unit.label() {
                snapshot
                    .set_property(crate::constants::LABEL_PROPERTY, unit_label)
                    .await?;
            }
            if let Some(version) = unit.version() {
                snapshot
                    .set_property(crate::constants::VERSION_PROPERTY, version)
                    .await?;
            }
            snapshot.mark_replicated().await?;
        }
        None => {
            return Err(SnapkeepError::Replication(format!(
                "snapshot {} is not visible on {} after receive",
                snapshot_name,
                destination.location()
            )))
        }
    }

    if let Some(readonly) = readonly {
        destination.set_readonly(readonly).await?;
    }

    delete_unit_files(dir, unit).await;
    Ok(())
}

/// Removes a consumed unit's segment and metadata files. Failures here must
/// not undo an otherwise-successful apply; they are logged and swallowed.
async fn delete_unit_files(dir: &Path, unit: &MetadataFile) {
    for segment in unit.segments() {
        let path = dir.join(segment);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not delete segment {}: {}", path.display(), e);
        }
    }
    if let Err(e) = tokio::fs::remove_file(unit.path()).await {
        warn!("Could not delete metadata {}: {}", unit.path().display(), e);
    }
}
