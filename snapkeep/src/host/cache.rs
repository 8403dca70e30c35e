// File: snapkeep/src/host/cache.rs
//! Per-host property cache.
//!
//! One bulk query enumerates every dataset and property on a host; per-object
//! queries would cost one tool invocation each. Mutations performed through
//! the dataset layer are written through so that later reads in the same run
//! stay consistent, and call sites that cross an endpoint boundary force a
//! full refresh instead.

use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

/// Property values are integers where they parse as such, text otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Number(u64),
    Text(String),
}

impl PropertyValue {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<u64>() {
            Ok(n) => PropertyValue::Number(n),
            Err(_) => PropertyValue::Text(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            PropertyValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Text(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::Text(s) => write!(f, "{}", s),
        }
    }
}

pub type PropertySet = HashMap<String, PropertyValue>;

/// Lazily populated map from dataset name to its property set.
#[derive(Default)]
pub struct PropertyCache {
    entries: Mutex<Option<HashMap<String, PropertySet>>>,
}

impl PropertyCache {
    pub async fn is_loaded(&self) -> bool {
        self.entries.lock().await.is_some()
    }

    /// Replaces the cache wholesale with the result of a bulk query.
    pub async fn replace(&self, entries: HashMap<String, PropertySet>) {
        debug!("Property cache replaced: {} datasets", entries.len());
        *self.entries.lock().await = Some(entries);
    }

    pub async fn get(&self, dataset: &str, property: &str) -> Option<PropertyValue> {
        self.entries
            .lock()
            .await
            .as_ref()
            .and_then(|entries| entries.get(dataset))
            .and_then(|props| props.get(property))
            .cloned()
    }

    /// Snapshots directly under a filesystem: cache keys of the form
    /// `<filesystem>@<short-name>`, together with their property sets.
    pub async fn snapshot_entries(&self, filesystem: &str) -> Vec<(String, PropertySet)> {
        let guard = self.entries.lock().await;
        let Some(entries) = guard.as_ref() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(name, _)| {
                name.split_once('@')
                    .is_some_and(|(dataset, _)| dataset == filesystem)
            })
            .map(|(name, props)| (name.clone(), props.clone()))
            .collect()
    }

    /// Applies the effect of a just-performed dataset creation without a
    /// full refresh.
    pub async fn insert(&self, dataset: &str, props: PropertySet) {
        if let Some(entries) = self.entries.lock().await.as_mut() {
            entries.insert(dataset.to_string(), props);
        }
    }

    /// Drops a destroyed dataset from the cache.
    pub async fn invalidate(&self, dataset: &str) {
        if let Some(entries) = self.entries.lock().await.as_mut() {
            entries.remove(dataset);
        }
    }

    pub async fn set(&self, dataset: &str, property: &str, value: PropertyValue) {
        if let Some(entries) = self.entries.lock().await.as_mut() {
            entries
                .entry(dataset.to_string())
                .or_default()
                .insert(property.to_string(), value);
        }
    }

    pub async fn unset(&self, dataset: &str, property: &str) {
        if let Some(entries) = self.entries.lock().await.as_mut() {
            if let Some(props) = entries.get_mut(dataset) {
                props.remove(property);
            }
        }
    }
}
