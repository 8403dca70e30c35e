// File: snapkeep/src/constants.rs

// Property namespace reserved on datasets managed by this tool.
pub const LABEL_PROPERTY: &str = "snapkeep:label";
pub const REPL_STATUS_PROPERTY: &str = "snapkeep:repl_status";
pub const VERSION_PROPERTY: &str = "snapkeep:version";

/// Value of the replication-status property once a transfer has completed.
pub const REPL_STATUS_SUCCESS: &str = "success";

/// Producer version written into snapshot properties and metadata files.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short snapshot names look like `snapkeep_20170116T160746Z`. The embedded
/// UTC timestamp is the sole ordering key.
pub const SNAPSHOT_PREFIX: &str = "snapkeep";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapkeep/snapkeep.toml";
pub const DEFAULT_LOCKFILE: &str = "/run/lock/snapkeep.lock";

pub const LOCK_POLL_SECONDS: u64 = 3;
pub const LOCK_TIMEOUT_SECONDS: u64 = 60;
