//! File-mediated replication tests.
//!
//! Both sides run against stub `zfs` executables; `split` and `cat` are the
//! real tools, so these cover the full segment lifecycle: cut, describe,
//! validate, reassemble, apply, clean up.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use snapkeep::constants::VERSION;
use snapkeep::replication::file::{receive_from_file, send_to_file};
use snapkeep::replication::metadata::MetadataFile;
use snapkeep::retention::{enforce_retention, KeepPolicy};
use snapkeep::{Filesystem, SnapkeepError};
use tempfile::TempDir;

struct Courier {
    _tmp: TempDir,
    transfer: PathBuf,
    src_state: PathBuf,
    dst_state: PathBuf,
    source: Filesystem,
    destination: Filesystem,
}

fn courier() -> Courier {
    let tmp = TempDir::new().unwrap();
    let transfer = common::transfer_dir(tmp.path());
    let src_state = tmp.path().join("src");
    let dst_state = tmp.path().join("dst");
    let source = Filesystem::new(common::stub_host(&src_state, &["tank/data"]), "tank/data");
    let destination = Filesystem::new(
        common::stub_host(&dst_state, &["pool/restore"]),
        "pool/restore",
    );
    Courier {
        _tmp: tmp,
        transfer,
        src_state,
        dst_state,
        source,
        destination,
    }
}

/// Writes a transfer unit directly, as a foreign producer would.
async fn craft_unit(
    transfer: &Path,
    timestamp: &str,
    label: &str,
    declared: &[&str],
    present: &[&str],
    depends_on: Option<&str>,
    version: &str,
) {
    for segment in present {
        fs::write(transfer.join(segment), b"segment-bytes").unwrap();
    }
    let mut metadata = MetadataFile::new(transfer.join(format!("tankdata_{}.json", timestamp)));
    metadata.set_label(label).unwrap();
    metadata
        .set_snapshot(&format!("snapkeep_{}", timestamp))
        .unwrap();
    metadata.set_version(version).unwrap();
    metadata.set_timestamp(timestamp).unwrap();
    if let Some(depends_on) = depends_on {
        metadata.set_depends_on(depends_on).unwrap();
    }
    metadata
        .set_segments(declared.iter().map(|s| s.to_string()).collect())
        .unwrap();
    metadata.write().await.unwrap();
}

#[tokio::test]
async fn send_then_receive_round_trip_completes_and_cleans_up() {
    let courier = courier();

    send_to_file(
        &courier.source,
        "courier",
        &courier.transfer,
        "tankdata",
        3,
        "128",
        None,
    )
    .await
    .unwrap();

    // One descriptor plus the segments it declares.
    let entries = common::dir_entries(&courier.transfer);
    assert_eq!(entries.iter().filter(|e| e.ends_with(".json")).count(), 1);
    assert!(entries.len() >= 2, "stream should have been segmented");

    let src_snapshots = common::snapshot_names(&courier.src_state);
    assert_eq!(src_snapshots.len(), 1);
    let src_snapshot = &src_snapshots[0];
    assert!(common::has_property(
        &courier.src_state,
        src_snapshot,
        "snapkeep:repl_status",
        "success"
    ));

    receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await
    .unwrap();

    // Consumed units leave nothing behind.
    assert!(common::dir_entries(&courier.transfer).is_empty());

    let short = src_snapshot.split('@').nth(1).unwrap();
    let dst_snapshot = format!("pool/restore@{}", short);
    assert!(common::has_property(
        &courier.dst_state,
        &dst_snapshot,
        "snapkeep:repl_status",
        "success"
    ));
    // Label and version are synthesized from the unit: the transport does
    // not carry custom properties on a first sync.
    assert!(common::has_property(
        &courier.dst_state,
        &dst_snapshot,
        "snapkeep:label",
        "courier"
    ));
    assert!(common::has_property(
        &courier.dst_state,
        &dst_snapshot,
        "snapkeep:version",
        VERSION
    ));

    // keep = { latest: 1 }: exactly one success-marked snapshot per side.
    let keep = KeepPolicy {
        latest: 1,
        ..Default::default()
    };
    enforce_retention(&courier.source, &keep, "courier", true, false, true)
        .await
        .unwrap();
    enforce_retention(&courier.destination, &keep, "courier", true, false, true)
        .await
        .unwrap();
    assert_eq!(common::snapshot_names(&courier.src_state).len(), 1);
    assert_eq!(common::snapshot_names(&courier.dst_state).len(), 1);
}

#[tokio::test]
async fn consecutive_sends_chain_incrementally_and_apply_in_order() {
    let courier = courier();

    for _ in 0..2 {
        send_to_file(
            &courier.source,
            "courier",
            &courier.transfer,
            "tankdata",
            3,
            "128",
            None,
        )
        .await
        .unwrap();
    }

    let mut descriptors: Vec<String> = common::dir_entries(&courier.transfer)
        .into_iter()
        .filter(|e| e.ends_with(".json"))
        .collect();
    descriptors.sort();
    assert_eq!(descriptors.len(), 2);

    let first = MetadataFile::read(&courier.transfer.join(&descriptors[0]))
        .await
        .unwrap();
    let second = MetadataFile::read(&courier.transfer.join(&descriptors[1]))
        .await
        .unwrap();
    assert_eq!(first.depends_on(), None);
    assert_eq!(second.depends_on(), first.snapshot());

    receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await
    .unwrap();

    assert!(common::dir_entries(&courier.transfer).is_empty());
    assert_eq!(common::snapshot_names(&courier.dst_state).len(), 2);
}

#[tokio::test]
async fn superseded_units_are_deleted_without_applying() {
    let courier = courier();

    // The destination already holds a newer replicated snapshot.
    let newer = "pool/restore@snapkeep_20300101T000000Z";
    common::seed_property(&courier.dst_state, newer, "snapkeep:label", "courier");
    common::seed_property(&courier.dst_state, newer, "snapkeep:repl_status", "success");

    let segment = "tankdata_20250101T000000Z-aaa";
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "courier",
        &[segment],
        &[segment],
        None,
        VERSION,
    )
    .await;

    receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await
    .unwrap();

    assert!(common::dir_entries(&courier.transfer).is_empty());
    // No stream was ever piped into the stub.
    assert!(!courier.dst_state.join("received").exists());
}

#[tokio::test]
async fn missing_segment_is_retryable_and_leaves_files_untouched() {
    let courier = courier();

    let declared = [
        "tankdata_20250101T000000Z-aaa",
        "tankdata_20250101T000000Z-aab",
    ];
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "courier",
        &declared,
        &declared[..1],
        None,
        VERSION,
    )
    .await;

    let result = receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await;

    let error = result.unwrap_err();
    assert!(matches!(error, SnapkeepError::SegmentMissing(_)));
    assert_eq!(error.exit_code(), 16);

    let entries = common::dir_entries(&courier.transfer);
    assert!(entries.contains(&"tankdata_20250101T000000Z.json".to_string()));
    assert!(entries.contains(&"tankdata_20250101T000000Z-aaa".to_string()));
    assert!(!courier.dst_state.join("received").exists());
}

#[tokio::test]
async fn broken_dependency_chain_is_a_replication_error() {
    let courier = courier();

    let segment = "tankdata_20250101T000000Z-aaa";
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "courier",
        &[segment],
        &[segment],
        Some("snapkeep_20240101T000000Z"),
        VERSION,
    )
    .await;

    let result = receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await;

    assert!(matches!(result, Err(SnapkeepError::Replication(_))));
    assert_eq!(common::dir_entries(&courier.transfer).len(), 2);
    assert!(!courier.dst_state.join("received").exists());
}

#[tokio::test]
async fn units_from_newer_producers_are_rejected_before_processing() {
    let courier = courier();

    let segment = "tankdata_20250101T000000Z-aaa";
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "courier",
        &[segment],
        &[segment],
        None,
        "999.0.0",
    )
    .await;

    let result = receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await;

    assert!(matches!(result, Err(SnapkeepError::Replication(_))));
    assert_eq!(common::dir_entries(&courier.transfer).len(), 2);
    assert!(!courier.dst_state.join("received").exists());
}

#[tokio::test]
async fn units_for_other_labels_are_skipped() {
    let courier = courier();

    let segment = "tankdata_20250101T000000Z-aaa";
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "someone-elses-policy",
        &[segment],
        &[segment],
        None,
        VERSION,
    )
    .await;

    receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await
    .unwrap();

    // Shared directory: the foreign unit stays for its own policy.
    assert_eq!(common::dir_entries(&courier.transfer).len(), 2);
    assert!(!courier.dst_state.join("received").exists());
}

#[tokio::test]
async fn incomplete_unit_stops_processing_of_later_units() {
    let courier = courier();

    // The older unit is incomplete; the newer one is fully present.
    let older = [
        "tankdata_20250101T000000Z-aaa",
        "tankdata_20250101T000000Z-aab",
    ];
    craft_unit(
        &courier.transfer,
        "20250101T000000Z",
        "courier",
        &older,
        &older[..1],
        None,
        VERSION,
    )
    .await;

    let newer = "tankdata_20250102T000000Z-aaa";
    craft_unit(
        &courier.transfer,
        "20250102T000000Z",
        "courier",
        &[newer],
        &[newer],
        None,
        VERSION,
    )
    .await;

    let result = receive_from_file(
        &courier.destination,
        "courier",
        &courier.transfer,
        "tankdata",
        None,
    )
    .await;

    assert!(matches!(result, Err(SnapkeepError::SegmentMissing(_))));
    // The later unit was neither applied nor deleted; dependency-chain
    // ordering would break otherwise.
    let entries = common::dir_entries(&courier.transfer);
    assert!(entries.contains(&"tankdata_20250102T000000Z.json".to_string()));
    assert!(entries.contains(&newer.to_string()));
    assert!(!courier.dst_state.join("received").exists());
}
