// File: snapkeep/src/policy/mod.rs
//! Sequences one policy run: lock, resolve endpoints, execute the matching
//! engine, prune afterwards.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::config::{
    policy_label, Config, PolicyConfig, ReceiveFromFilePolicy, ReplicatePolicy, SendToFilePolicy,
    SnapshotPolicy,
};
use crate::errors::{Result, SnapkeepError};
use crate::host::Host;
use crate::lock::RunLock;
use crate::replication::{direct, file};
use crate::retention::enforce_retention;

/// Runs one named policy under the shared run lock.
pub async fn run(config: &Config, policy_name: &str, lockfile: &Path, reset: bool) -> Result<()> {
    let _lock = RunLock::acquire(lockfile).await?;
    execute_policy(config, policy_name, reset).await
}

pub async fn execute_policy(config: &Config, policy_name: &str, reset: bool) -> Result<()> {
    match config.policy(policy_name)? {
        PolicyConfig::Snapshot(policy) => {
            run_snapshot_policy(config, policy_name, policy, reset).await
        }
        PolicyConfig::Replicate(policy) => {
            run_replicate_policy(config, policy_name, policy, reset).await
        }
        PolicyConfig::SendToFile(policy) => {
            run_send_to_file_policy(config, policy_name, policy, reset).await
        }
        PolicyConfig::ReceiveFromFile(policy) => {
            run_receive_from_file_policy(config, policy_name, policy, reset).await
        }
    }
}

/// Parses `user@host:fs` into a filesystem name and an optional ssh endpoint.
pub fn parse_location(location: &str) -> (String, Option<(String, String)>) {
    if let Some((user, tail)) = location.split_once('@') {
        if let Some((host, fs_name)) = tail.split_once(':') {
            return (
                fs_name.to_string(),
                Some((user.to_string(), host.to_string())),
            );
        }
    }
    (location.to_string(), None)
}

fn host_for(
    config: &Config,
    endpoint: Option<(String, String)>,
    overrides: &HashMap<String, String>,
) -> Arc<Host> {
    let mut cmds = config.cmds.clone();
    cmds.extend(overrides.clone());
    Arc::new(Host::new(cmds, endpoint))
}

async fn run_snapshot_policy(
    config: &Config,
    policy_name: &str,
    policy: &SnapshotPolicy,
    reset: bool,
) -> Result<()> {
    let label = policy_label(&policy.label, policy_name);
    let host = host_for(config, None, &HashMap::new());

    if reset {
        warn!("Reset is enabled; removing all snapshots for this policy");
    }

    let filesystems = Host::filesystems(&host, &policy.include, &policy.exclude).await?;
    for filesystem in &filesystems {
        if !reset {
            filesystem.create_snapshot(label, policy.recursive).await?;
        }
        enforce_retention(
            filesystem,
            &policy.keep,
            label,
            policy.recursive,
            reset,
            false,
        )
        .await?;
    }
    Ok(())
}

async fn run_replicate_policy(
    config: &Config,
    policy_name: &str,
    policy: &ReplicatePolicy,
    reset: bool,
) -> Result<()> {
    let label = policy_label(&policy.label, policy_name);

    let (source_name, source_endpoint) = parse_location(&policy.source);
    let source_host = host_for(config, source_endpoint, &HashMap::new());
    let source = Host::filesystem(&source_host, &source_name)
        .await?
        .ok_or_else(|| {
            SnapkeepError::Replication(format!("the filesystem {} does not exist", policy.source))
        })?;

    let (destination_name, destination_endpoint) = parse_location(&policy.destination);
    let destination_host = host_for(config, destination_endpoint, &policy.destination_cmds);
    let destination = Host::filesystem(&destination_host, &destination_name)
        .await?
        .ok_or_else(|| {
            SnapkeepError::Replication(format!(
                "the filesystem {} does not exist",
                policy.destination
            ))
        })?;

    if reset {
        warn!("Reset is enabled; reinitializing replication for this policy");
        enforce_retention(&destination, &policy.keep, label, true, reset, true).await?;
    } else {
        direct::replicate(
            &source,
            &destination,
            label,
            policy.base_snapshot.as_deref(),
            policy.readonly,
        )
        .await?;
    }

    enforce_retention(&source, &policy.keep, label, true, reset, true).await
}

async fn run_send_to_file_policy(
    config: &Config,
    policy_name: &str,
    policy: &SendToFilePolicy,
    reset: bool,
) -> Result<()> {
    let label = policy_label(&policy.label, policy_name);

    let (source_name, source_endpoint) = parse_location(&policy.source);
    let source_host = host_for(config, source_endpoint, &HashMap::new());
    let source = Host::filesystem(&source_host, &source_name)
        .await?
        .ok_or_else(|| {
            SnapkeepError::Replication(format!("the filesystem {} does not exist", policy.source))
        })?;

    if reset {
        warn!("Reset is enabled; reinitializing replication for this policy");
    } else {
        file::send_to_file(
            &source,
            label,
            &policy.dir,
            &policy.file_prefix,
            policy.suffix_length,
            &policy.split_size,
            policy.base_snapshot.as_deref(),
        )
        .await?;
    }

    enforce_retention(&source, &policy.keep, label, true, reset, true).await
}

async fn run_receive_from_file_policy(
    config: &Config,
    policy_name: &str,
    policy: &ReceiveFromFilePolicy,
    reset: bool,
) -> Result<()> {
    let label = policy_label(&policy.label, policy_name);

    let host = host_for(config, None, &HashMap::new());
    let destination = Host::filesystem(&host, &policy.destination)
        .await?
        .ok_or_else(|| {
            SnapkeepError::Replication(format!(
                "the filesystem {} does not exist",
                policy.destination
            ))
        })?;

    if reset {
        warn!("Reset is enabled; reinitializing replication for this policy");
        return enforce_retention(&destination, &policy.keep, label, true, reset, true).await;
    }

    let received = file::receive_from_file(
        &destination,
        label,
        &policy.dir,
        &policy.file_prefix,
        policy.readonly,
    )
    .await;

    match &received {
        Ok(()) | Err(SnapkeepError::SegmentMissing(_)) => {
            // An incomplete unit stops the apply loop but does not cancel
            // pruning of what already landed.
            enforce_retention(&destination, &policy.keep, label, true, reset, true).await?;
        }
        Err(_) => {}
    }
    received
}
