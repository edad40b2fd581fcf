use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::retention::DEFAULT_RETENTION_DAYS;

/// Engine configuration, constructed or deserialized by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// SQLite database file; parent directories are created on init.
    pub db_path: PathBuf,
    /// Raw events and summaries older than this are pruned.
    pub retention_days: u32,
    /// Widest window still answered from raw events; wider windows read
    /// daily summaries.
    pub raw_query_threshold_hours: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("telemetry.db"),
            retention_days: DEFAULT_RETENTION_DAYS,
            raw_query_threshold_hours: 24,
        }
    }
}
