// File: snapkeep/src/replication/metadata.rs
//! The descriptor for one file-mediated transfer unit.
//!
//! A unit is a send stream cut into segment files plus this JSON descriptor.
//! Every field except `depends_on` must be present and well-formed before a
//! descriptor may be written, and a descriptor whose checksum fails to
//! verify on read is rejected outright.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

use crate::constants::SNAPSHOT_PREFIX;
use crate::dataset::parse_timestamp;
use crate::errors::{Result, SnapkeepError};

fn timestamp_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{8}T\d{6}Z$").expect("static pattern"))
}

fn snapshot_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"^{}_\d{{8}}T\d{{6}}Z$", SNAPSHOT_PREFIX)).expect("static pattern")
    })
}

#[derive(Debug, Clone)]
pub struct MetadataFile {
    path: PathBuf,
    version: Option<String>,
    timestamp: Option<String>,
    label: Option<String>,
    snapshot: Option<String>,
    depends_on: Option<String>,
    segments: Vec<String>,
}

impl MetadataFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: None,
            timestamp: None,
            label: None,
            snapshot: None,
            depends_on: None,
            segments: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_version(&mut self, version: &str) -> Result<()> {
        if version.is_empty() {
            return Err(SnapkeepError::Metadata(
                "version must be a non-empty string".to_string(),
            ));
        }
        self.version = Some(version.to_string());
        Ok(())
    }

    pub fn set_timestamp(&mut self, timestamp: &str) -> Result<()> {
        if !timestamp_pattern().is_match(timestamp) {
            return Err(SnapkeepError::Metadata(format!(
                "'{}' is not a valid timestamp",
                timestamp
            )));
        }
        parse_timestamp(timestamp)
            .map_err(|_| SnapkeepError::Metadata(format!("'{}' is not a valid timestamp", timestamp)))?;
        self.timestamp = Some(timestamp.to_string());
        Ok(())
    }

    pub fn set_label(&mut self, label: &str) -> Result<()> {
        if label.is_empty() {
            return Err(SnapkeepError::Metadata(
                "label must be a non-empty string".to_string(),
            ));
        }
        self.label = Some(label.to_string());
        Ok(())
    }

    pub fn set_snapshot(&mut self, snapshot: &str) -> Result<()> {
        self.snapshot = Some(validate_snapshot_name(snapshot)?);
        Ok(())
    }

    pub fn set_depends_on(&mut self, snapshot: &str) -> Result<()> {
        self.depends_on = Some(validate_snapshot_name(snapshot)?);
        Ok(())
    }

    pub fn set_segments(&mut self, segments: Vec<String>) -> Result<()> {
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(SnapkeepError::Metadata(
                "segments must be a non-empty list of file names".to_string(),
            ));
        }
        self.segments = segments;
        Ok(())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.timestamp.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn depends_on(&self) -> Option<&str> {
        self.depends_on.as_deref()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The transfer unit's creation instant.
    pub fn datetime(&self) -> Result<DateTime<Utc>> {
        let timestamp = self
            .timestamp
            .as_deref()
            .ok_or_else(|| SnapkeepError::Metadata("metadata has no timestamp".to_string()))?;
        parse_timestamp(timestamp)
            .map_err(|_| SnapkeepError::Metadata(format!("'{}' is not a valid timestamp", timestamp)))
    }

    pub fn snapshot_name(&self) -> Result<&str> {
        self.snapshot
            .as_deref()
            .ok_or_else(|| SnapkeepError::Metadata("metadata has no snapshot name".to_string()))
    }

    /// All fields as a JSON object, without the checksum. Fails when any
    /// required field is still unset.
    fn fields(&self) -> Result<Map<String, Value>> {
        let require = |value: &Option<String>, field: &str| -> Result<String> {
            value
                .clone()
                .ok_or_else(|| SnapkeepError::Metadata(format!("metadata field '{}' is not set", field)))
        };

        if self.segments.is_empty() {
            return Err(SnapkeepError::Metadata(
                "metadata field 'segments' is not set".to_string(),
            ));
        }

        let mut fields = Map::new();
        fields.insert("label".to_string(), Value::from(require(&self.label, "label")?));
        fields.insert(
            "snapshot".to_string(),
            Value::from(require(&self.snapshot, "snapshot")?),
        );
        fields.insert(
            "version".to_string(),
            Value::from(require(&self.version, "version")?),
        );
        fields.insert(
            "timestamp".to_string(),
            Value::from(require(&self.timestamp, "timestamp")?),
        );
        fields.insert(
            "depends_on".to_string(),
            match &self.depends_on {
                Some(name) => Value::from(name.clone()),
                None => Value::Null,
            },
        );
        fields.insert(
            "segments".to_string(),
            Value::from(self.segments.clone()),
        );
        Ok(fields)
    }

    /// Writes the descriptor. All fields are validated before any byte hits
    /// disk.
    pub async fn write(&self) -> Result<()> {
        let mut fields = self.fields()?;
        let checksum = compute_checksum(&fields)?;
        fields.insert("checksum".to_string(), Value::from(checksum));

        let body = serde_json::to_string(&Value::Object(fields))
            .map_err(|e| SnapkeepError::Metadata(format!("failed to serialize metadata: {}", e)))?;
        tokio::fs::write(&self.path, body).await.map_err(|e| {
            SnapkeepError::Metadata(format!("failed to write {}: {}", self.path.display(), e))
        })?;
        info!("Metadata written to {}", self.path.display());
        Ok(())
    }

    /// Reads and validates a descriptor. A checksum mismatch rejects the
    /// unit; its contents are untrusted.
    pub async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            SnapkeepError::Metadata(format!("failed to read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            SnapkeepError::Metadata(format!("{} is not valid JSON: {}", path.display(), e))
        })?;
        let Value::Object(mut object) = value else {
            return Err(SnapkeepError::Metadata(format!(
                "{} does not contain a JSON object",
                path.display()
            )));
        };

        let declared = match object.remove("checksum") {
            Some(Value::String(checksum)) => checksum,
            _ => {
                return Err(SnapkeepError::Metadata(format!(
                    "{} carries no checksum",
                    path.display()
                )))
            }
        };
        let computed = compute_checksum(&object)?;
        if computed != declared {
            return Err(SnapkeepError::Metadata(format!(
                "checksum mismatch in {} (expected {}, found {})",
                path.display(),
                computed,
                declared
            )));
        }

        let text = |object: &Map<String, Value>, field: &str| -> Result<String> {
            match object.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                _ => Err(SnapkeepError::Metadata(format!(
                    "{} field '{}' is missing or not a string",
                    path.display(),
                    field
                ))),
            }
        };

        let mut metadata = MetadataFile::new(path);
        metadata.set_label(&text(&object, "label")?)?;
        metadata.set_snapshot(&text(&object, "snapshot")?)?;
        metadata.set_version(&text(&object, "version")?)?;
        metadata.set_timestamp(&text(&object, "timestamp")?)?;
        match object.get("depends_on") {
            Some(Value::String(name)) => metadata.set_depends_on(name)?,
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(SnapkeepError::Metadata(format!(
                    "{} field 'depends_on' is not a string",
                    path.display()
                )))
            }
        }
        let segments = match object.get("segments") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(SnapkeepError::Metadata(format!(
                        "{} field 'segments' contains a non-string entry",
                        path.display()
                    ))),
                })
                .collect::<Result<Vec<String>>>()?,
            _ => {
                return Err(SnapkeepError::Metadata(format!(
                    "{} field 'segments' is missing or not a list",
                    path.display()
                )))
            }
        };
        metadata.set_segments(segments)?;
        Ok(metadata)
    }
}

fn validate_snapshot_name(name: &str) -> Result<String> {
    if !snapshot_name_pattern().is_match(name) {
        return Err(SnapkeepError::Metadata(format!(
            "'{}' is not a valid snapshot name",
            name
        )));
    }
    Ok(name.to_string())
}

/// md5 over the fields serialized with sorted keys and compact separators.
/// Insertion order never influences the result.
fn compute_checksum(fields: &Map<String, Value>) -> Result<String> {
    let canonical: std::collections::BTreeMap<&String, &Value> = fields.iter().collect();
    let serialized = serde_json::to_string(&canonical)
        .map_err(|e| SnapkeepError::Metadata(format!("failed to serialize metadata: {}", e)))?;
    Ok(format!("{:x}", md5::compute(serialized.as_bytes())))
}

/// Compares dotted-numeric version strings, e.g. `1.10.2` against `1.9`.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let parse = |version: &str| -> Result<Vec<u64>> {
        version
            .split('.')
            .map(|part| {
                part.parse::<u64>().map_err(|_| {
                    SnapkeepError::Metadata(format!("'{}' is not a valid version string", version))
                })
            })
            .collect()
    };
    Ok(parse(a)?.cmp(&parse(b)?))
}
