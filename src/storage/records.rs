use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Latest value of one (form, field) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormValue {
    pub form_name: String,
    pub field_name: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<i64>,
}

/// Immutable record of one value change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub form_name: String,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub changed_at: DateTime<Utc>,
    pub changed_by: Option<i64>,
}

/// A target file that has already been merged. Keyed by canonical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFileRecord {
    pub path: String,
    /// Modification time in seconds since the unix epoch
    pub mtime: f64,
    pub processed_at: DateTime<Utc>,
}

/// One tag written into a target file during a merge pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionLogEntry {
    pub ldx_path: String,
    pub field_id: String,
    pub value: String,
    pub was_update: bool,
    pub injected_at: DateTime<Utc>,
}

impl InjectionLogEntry {
    /// Bare file name of the target, used by the per-file queries
    pub fn file_name(&self) -> String {
        std::path::Path::new(&self.ldx_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.ldx_path.clone())
    }
}

/// Aggregate injection counts for one target file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionStats {
    pub file_name: String,
    pub total: u64,
    pub updates: u64,
    #[serde(rename = "static")]
    pub static_count: u64,
}

/// Result of one form submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// Fields whose value changed (one audit entry each)
    pub changed: usize,
    /// Fields re-submitted with their current value
    pub unchanged: usize,
}

/// One row of the telemetry sensor registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: i64,
    pub sensor_id: String,
    pub name: String,
    pub unit: String,
    pub min_value: f64,
    pub max_value: f64,
    pub group: String,
    pub sort_order: i64,
    pub enabled: bool,
}

// Fixed precision keeps lexical order equal to chronological order in SQLite.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
        })
}
