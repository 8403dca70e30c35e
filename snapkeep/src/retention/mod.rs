// File: snapkeep/src/retention/mod.rs
//! Decides which snapshots survive a policy run.
//!
//! The decision depends only on the snapshot set and the current wall-clock
//! instant; planning is a pure function over snapshot facts so it can be
//! tested without touching a host.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::constants::{REPL_STATUS_SUCCESS, TIMESTAMP_FORMAT};
use crate::dataset::{Dataset, Filesystem, Snapshot};
use crate::errors::Result;

/// How many snapshots to keep, per bucket. `latest` keeps the N newest
/// unconditionally; the interval buckets keep at most one snapshot per
/// completed hour/day/week/month/year slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeepPolicy {
    pub latest: u32,
    pub hourly: u32,
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interval {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

const INTERVALS: [Interval; 5] = [
    Interval::Hourly,
    Interval::Daily,
    Interval::Weekly,
    Interval::Monthly,
    Interval::Yearly,
];

impl Interval {
    fn name(self) -> &'static str {
        match self {
            Interval::Hourly => "hourly",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Yearly => "yearly",
        }
    }

    fn count(self, policy: &KeepPolicy) -> u32 {
        match self {
            Interval::Hourly => policy.hourly,
            Interval::Daily => policy.daily,
            Interval::Weekly => policy.weekly,
            Interval::Monthly => policy.monthly,
            Interval::Yearly => policy.yearly,
        }
    }

    /// Truncates an instant down to this bucket's granularity. Weeks start
    /// on Monday; all boundaries are UTC.
    fn floor(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = t.date_naive();
        let start = match self {
            Interval::Hourly => date.and_hms_opt(t.hour(), 0, 0)?,
            Interval::Daily => date.and_hms_opt(0, 0, 0)?,
            Interval::Weekly => {
                let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                monday.and_hms_opt(0, 0, 0)?
            }
            Interval::Monthly => {
                NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_hms_opt(0, 0, 0)?
            }
            Interval::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_hms_opt(0, 0, 0)?,
        };
        Some(start.and_utc())
    }

    /// The bucket boundary one step before `t`, which must itself be a
    /// boundary of this interval.
    fn step_back(self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Interval::Hourly => Some(t - Duration::hours(1)),
            Interval::Daily => Some(t - Duration::days(1)),
            Interval::Weekly => Some(t - Duration::weeks(1)),
            Interval::Monthly => {
                let (year, month) = match t.month() {
                    1 => (t.year() - 1, 12),
                    m => (t.year(), m - 1),
                };
                Some(NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
            }
            Interval::Yearly => {
                Some(NaiveDate::from_ymd_opt(t.year() - 1, 1, 1)?.and_hms_opt(0, 0, 0)?.and_utc())
            }
        }
    }
}

/// The facts the planner needs about one snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFacts {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub repl_status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KeptSnapshot {
    pub name: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RetentionPlan {
    pub keep: Vec<KeptSnapshot>,
    /// Snapshots to destroy, oldest first.
    pub destroy: Vec<String>,
}

/// Computes the keep-set for one (filesystem, label) snapshot set.
///
/// With `reset` the keep-set is empty. With `replication_role` the most
/// recent successfully replicated snapshot is pinned, and any snapshot whose
/// replication status is not "success" is removed from the keep-set no
/// matter how it qualified.
pub fn plan(
    snapshots: &[SnapshotFacts],
    policy: &KeepPolicy,
    now: DateTime<Utc>,
    reset: bool,
    replication_role: bool,
) -> RetentionPlan {
    let mut newest_first: Vec<&SnapshotFacts> = snapshots.iter().collect();
    newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut keep: Vec<KeptSnapshot> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut add_reason = |keep: &mut Vec<KeptSnapshot>, name: &str, reason: String| {
        let position = *index.entry(name.to_string()).or_insert_with(|| {
            keep.push(KeptSnapshot {
                name: name.to_string(),
                reasons: Vec::new(),
            });
            keep.len() - 1
        });
        keep[position].reasons.push(reason);
    };

    if !reset {
        for snapshot in newest_first.iter().take(policy.latest as usize) {
            add_reason(&mut keep, &snapshot.name, "latest".to_string());
        }

        for interval in INTERVALS {
            let slots = interval.count(policy);
            if slots == 0 {
                continue;
            }
            let Some(mut upper) = interval.floor(now) else {
                continue;
            };
            for _ in 0..slots {
                let Some(lower) = interval.step_back(upper) else {
                    break;
                };
                if let Some(snapshot) = newest_first
                    .iter()
                    .find(|s| s.created_at >= lower && s.created_at < upper)
                {
                    add_reason(
                        &mut keep,
                        &snapshot.name,
                        format!("{} slot {}", interval.name(), lower.format(TIMESTAMP_FORMAT)),
                    );
                }
                upper = lower;
            }
        }

        if replication_role {
            // The anchor for the next incremental send must survive even if
            // no bucket rule would retain it.
            if let Some(snapshot) = newest_first
                .iter()
                .find(|s| s.repl_status.as_deref() == Some(REPL_STATUS_SUCCESS))
            {
                add_reason(&mut keep, &snapshot.name, "replication base".to_string());
            }
        }
    }

    if replication_role {
        // Failed or in-flight replication snapshots are never worth keeping.
        let by_name: HashMap<&str, &SnapshotFacts> =
            snapshots.iter().map(|s| (s.name.as_str(), s)).collect();
        keep.retain(|kept| {
            by_name
                .get(kept.name.as_str())
                .is_some_and(|s| s.repl_status.as_deref() == Some(REPL_STATUS_SUCCESS))
        });
    }

    let kept_names: HashSet<&str> = keep.iter().map(|k| k.name.as_str()).collect();
    let destroy: Vec<String> = newest_first
        .iter()
        .rev()
        .filter(|s| !kept_names.contains(s.name.as_str()))
        .map(|s| s.name.clone())
        .collect();

    RetentionPlan { keep, destroy }
}

/// Applies a keep-policy to one (filesystem, label) pair: every snapshot not
/// in the keep-set is destroyed, kept snapshots are logged with their
/// accumulated keep reasons.
pub async fn enforce_retention(
    filesystem: &Filesystem,
    policy: &KeepPolicy,
    label: &str,
    recursive: bool,
    reset: bool,
    replication_role: bool,
) -> Result<()> {
    let snapshots = filesystem.snapshots(Some(label)).await?;

    let mut facts = Vec::with_capacity(snapshots.len());
    for snapshot in &snapshots {
        facts.push(SnapshotFacts {
            name: snapshot.name().to_string(),
            created_at: snapshot.created_at(),
            repl_status: snapshot.repl_status().await?,
        });
    }

    let outcome = plan(&facts, policy, Utc::now(), reset, replication_role);

    let mut by_name: HashMap<String, Snapshot> = snapshots
        .into_iter()
        .map(|s| (s.name().to_string(), s))
        .collect();

    for kept in &outcome.keep {
        if let Some(snapshot) = by_name.get_mut(&kept.name) {
            for reason in &kept.reasons {
                snapshot.add_keep_reason(reason.clone());
            }
            info!(
                "Keeping {} ({})",
                snapshot.name(),
                snapshot.keep_reasons().join(", ")
            );
        }
    }

    for name in &outcome.destroy {
        if let Some(snapshot) = by_name.get(name) {
            snapshot.destroy(recursive, false).await?;
        }
    }

    Ok(())
}
