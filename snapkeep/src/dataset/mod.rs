// File: snapkeep/src/dataset/mod.rs
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;

use crate::constants::{
    LABEL_PROPERTY, REPL_STATUS_PROPERTY, REPL_STATUS_SUCCESS, SNAPSHOT_PREFIX, TIMESTAMP_FORMAT,
    VERSION, VERSION_PROPERTY,
};
use crate::errors::{Result, SnapkeepError};
use crate::host::cache::{PropertySet, PropertyValue};
use crate::host::Host;

fn short_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^{}_\d{{8}}T\d{{6}}Z$", SNAPSHOT_PREFIX)).expect("static pattern")
    })
}

/// Whether a short snapshot name belongs to this tool's namespace.
pub fn is_managed_short_name(short: &str) -> bool {
    short_name_pattern().is_match(short)
}

pub fn parse_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| SnapkeepError::Snapshot(format!("invalid snapshot timestamp '{}': {}", ts, e)))
}

/// Named dataset with cached properties.
#[allow(async_fn_in_trait)]
pub trait Dataset {
    fn host(&self) -> &Arc<Host>;
    fn name(&self) -> &str;

    /// `user@host:name` for remote datasets, the bare name locally.
    fn location(&self) -> String {
        match self.host().ssh_endpoint() {
            Some((user, host)) => format!("{}@{}:{}", user, host, self.name()),
            None => self.name().to_string(),
        }
    }

    async fn property(&self, property: &str) -> Result<Option<PropertyValue>> {
        self.host().property(self.name(), property).await
    }

    async fn set_property(&self, property: &str, value: &str) -> Result<()> {
        self.host()
            .output(
                "zfs",
                vec![
                    "set".to_string(),
                    format!("{}={}", property, value),
                    self.name().to_string(),
                ],
            )
            .await?;
        self.host()
            .cache
            .set(self.name(), property, PropertyValue::parse(value))
            .await;
        Ok(())
    }

    async fn unset_property(&self, property: &str) -> Result<()> {
        self.host()
            .output(
                "zfs",
                vec![
                    "inherit".to_string(),
                    property.to_string(),
                    self.name().to_string(),
                ],
            )
            .await?;
        self.host().cache.unset(self.name(), property).await;
        Ok(())
    }
}

/// A mutable container dataset with a hierarchical path name.
pub struct Filesystem {
    host: Arc<Host>,
    name: String,
}

impl Dataset for Filesystem {
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Filesystem {
    pub fn new(host: Arc<Host>, name: impl Into<String>) -> Self {
        Self {
            host,
            name: name.into(),
        }
    }

    /// Snapshots of this filesystem managed by this tool, oldest first.
    /// With a label, only snapshots tagged with it are returned.
    pub async fn snapshots(&self, label: Option<&str>) -> Result<Vec<Snapshot>> {
        self.host.ensure_cache().await?;
        let entries = self.host.cache.snapshot_entries(&self.name).await;

        let mut snapshots = Vec::new();
        for (name, props) in entries {
            let Some((_, short)) = name.split_once('@') else {
                continue;
            };
            if !is_managed_short_name(short) {
                continue;
            }
            if let Some(label) = label {
                let tagged = props
                    .get(LABEL_PROPERTY)
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| v == label);
                if !tagged {
                    continue;
                }
            }
            snapshots.push(Snapshot::new(Arc::clone(&self.host), &name)?);
        }
        snapshots.sort_by_key(|s| s.created_at());
        Ok(snapshots)
    }

    /// The most recent snapshot already marked as successfully replicated
    /// for this label; the anchor for the next incremental send.
    pub async fn latest_replication_snapshot(&self, label: &str) -> Result<Option<Snapshot>> {
        let mut snapshots = self.snapshots(Some(label)).await?;
        snapshots.reverse();
        for snapshot in snapshots {
            if snapshot.is_replicated().await? {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    /// Resolves a snapshot of this filesystem by its short name, any label.
    pub async fn snapshot_by_short_name(&self, short: &str) -> Result<Option<Snapshot>> {
        let snapshots = self.snapshots(None).await?;
        Ok(snapshots.into_iter().find(|s| s.short_name() == short))
    }

    /// Creates a labeled snapshot named after the current UTC second and
    /// tagged with the producer version.
    pub async fn create_snapshot(&self, label: &str, recursive: bool) -> Result<Snapshot> {
        if label.is_empty() || label == "-" {
            return Err(SnapkeepError::Snapshot(format!(
                "'{}' is not a valid label",
                label
            )));
        }

        // Snapshot names have second resolution; wait out the current second
        // so two runs in close succession cannot collide.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let now = Utc::now();
        let short = format!("{}_{}", SNAPSHOT_PREFIX, now.format(TIMESTAMP_FORMAT));
        let name = format!("{}@{}", self.name, short);
        info!("Creating snapshot {}", name);

        let mut args = vec![
            "snapshot".to_string(),
            "-o".to_string(),
            format!("{}={}", LABEL_PROPERTY, label),
            "-o".to_string(),
            format!("{}={}", VERSION_PROPERTY, VERSION),
        ];
        if recursive {
            args.push("-r".to_string());
        }
        args.push(name.clone());
        self.host.output("zfs", args).await?;

        let mut props = PropertySet::new();
        props.insert(
            LABEL_PROPERTY.to_string(),
            PropertyValue::Text(label.to_string()),
        );
        props.insert(
            VERSION_PROPERTY.to_string(),
            PropertyValue::Text(VERSION.to_string()),
        );
        self.host.cache.insert(&name, props).await;

        Snapshot::new(Arc::clone(&self.host), &name)
    }

    /// Sets or clears the read-only property on this filesystem.
    pub async fn set_readonly(&self, readonly: bool) -> Result<()> {
        if readonly {
            self.set_property("readonly", "on").await
        } else {
            self.unset_property("readonly").await
        }
    }
}

/// An immutable point-in-time child of a filesystem. The timestamp embedded
/// in the name orders snapshots; property annotations (label, version,
/// replication status) remain writable.
pub struct Snapshot {
    host: Arc<Host>,
    name: String,
    dataset_name: String,
    short_name: String,
    created_at: DateTime<Utc>,
    /// Why retention decided to keep this snapshot. Diagnostics only, never
    /// persisted.
    keep_reasons: Vec<String>,
}

impl Dataset for Snapshot {
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Snapshot {
    pub fn new(host: Arc<Host>, name: &str) -> Result<Self> {
        let (dataset_name, short_name) = name.split_once('@').ok_or_else(|| {
            SnapkeepError::Snapshot(format!("'{}' is not a snapshot name", name))
        })?;
        if !is_managed_short_name(short_name) {
            return Err(SnapkeepError::Snapshot(format!(
                "'{}' does not match the managed snapshot name pattern",
                name
            )));
        }
        let timestamp = &short_name[SNAPSHOT_PREFIX.len() + 1..];
        let created_at = parse_timestamp(timestamp)?;

        Ok(Self {
            host,
            name: name.to_string(),
            dataset_name: dataset_name.to_string(),
            short_name: short_name.to_string(),
            created_at,
            keep_reasons: Vec::new(),
        })
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    /// The raw timestamp token embedded in the name.
    pub fn timestamp_str(&self) -> &str {
        &self.short_name[SNAPSHOT_PREFIX.len() + 1..]
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn label(&self) -> Result<Option<String>> {
        Ok(self
            .property(LABEL_PROPERTY)
            .await?
            .map(|v| v.to_string()))
    }

    pub async fn repl_status(&self) -> Result<Option<String>> {
        Ok(self
            .property(REPL_STATUS_PROPERTY)
            .await?
            .map(|v| v.to_string()))
    }

    pub async fn is_replicated(&self) -> Result<bool> {
        Ok(self.repl_status().await?.as_deref() == Some(REPL_STATUS_SUCCESS))
    }

    /// Marks this snapshot as successfully replicated.
    pub async fn mark_replicated(&self) -> Result<()> {
        self.set_property(REPL_STATUS_PROPERTY, REPL_STATUS_SUCCESS)
            .await
    }

    pub async fn destroy(&self, recursive: bool, deferred: bool) -> Result<()> {
        info!("Destroying snapshot {}", self.name);
        let mut args = vec!["destroy".to_string()];
        if recursive {
            args.push("-r".to_string());
        }
        if deferred {
            args.push("-d".to_string());
        }
        args.push(self.name.clone());
        self.host.output("zfs", args).await?;
        self.host.cache.invalidate(&self.name).await;
        Ok(())
    }

    pub fn add_keep_reason(&mut self, reason: impl Into<String>) {
        self.keep_reasons.push(reason.into());
    }

    pub fn keep_reasons(&self) -> &[String] {
        &self.keep_reasons
    }
}
