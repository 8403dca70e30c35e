// File: snapkeep/src/config/mod.rs
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SnapkeepError};
use crate::retention::KeepPolicy;

/// Top-level configuration: a table of logical tool names to executable
/// paths, plus one table per policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cmds: HashMap<String, String>,
    #[serde(default)]
    pub policies: HashMap<String, PolicyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    Snapshot(SnapshotPolicy),
    Replicate(ReplicatePolicy),
    SendToFile(SendToFilePolicy),
    ReceiveFromFile(ReceiveFromFilePolicy),
}

/// Create labeled snapshots across matching filesystems and prune them.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotPolicy {
    #[serde(default)]
    pub recursive: bool,
    /// Glob filters over filesystem names. An empty include list selects
    /// every filesystem not excluded.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub keep: KeepPolicy,
    pub label: Option<String>,
}

/// Stream snapshots from a source filesystem into a destination filesystem
/// through a live pipe.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatePolicy {
    pub source: String,
    /// `user@host:fs` for a remote endpoint, plain filesystem name otherwise.
    pub destination: String,
    /// Tool-path overrides for the destination endpoint.
    #[serde(default)]
    pub destination_cmds: HashMap<String, String>,
    /// Explicit incremental base; the newest successfully replicated
    /// snapshot is used when unset.
    pub base_snapshot: Option<String>,
    pub readonly: Option<bool>,
    #[serde(default)]
    pub keep: KeepPolicy,
    pub label: Option<String>,
}

/// Write a send stream as size-bounded segment files plus a checksummed
/// metadata descriptor into a transfer directory.
#[derive(Debug, Clone, Deserialize)]
pub struct SendToFilePolicy {
    pub source: String,
    pub dir: PathBuf,
    pub file_prefix: String,
    #[serde(default = "default_suffix_length")]
    pub suffix_length: u32,
    #[serde(default = "default_split_size")]
    pub split_size: String,
    pub base_snapshot: Option<String>,
    #[serde(default)]
    pub keep: KeepPolicy,
    pub label: Option<String>,
}

/// Validate, reassemble and apply transfer units found in a directory.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiveFromFilePolicy {
    pub destination: String,
    pub dir: PathBuf,
    pub file_prefix: String,
    pub readonly: Option<bool>,
    #[serde(default)]
    pub keep: KeepPolicy,
    pub label: Option<String>,
}

fn default_suffix_length() -> u32 {
    4
}

fn default_split_size() -> String {
    "1G".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SnapkeepError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| SnapkeepError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SnapkeepError::Config(e.to_string()))
    }

    pub fn policy(&self, name: &str) -> Result<&PolicyConfig> {
        self.policies
            .get(name)
            .ok_or_else(|| SnapkeepError::Config(format!("the policy '{}' is not defined", name)))
    }
}

/// The label a policy tags its snapshots with defaults to the policy name.
pub fn policy_label<'a>(label: &'a Option<String>, policy_name: &'a str) -> &'a str {
    label.as_deref().unwrap_or(policy_name)
}
