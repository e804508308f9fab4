//! Core domain model for civic development-project collection.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "devwatch-core";

/// Closed status vocabulary shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProjectStatus {
    Active,
    Pending,
    Complete,
    #[default]
    Unknown,
}

impl ProjectStatus {
    pub const ALL: [ProjectStatus; 4] = [
        ProjectStatus::Active,
        ProjectStatus::Pending,
        ProjectStatus::Complete,
        ProjectStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Active => "Active",
            ProjectStatus::Pending => "Pending",
            ProjectStatus::Complete => "Complete",
            ProjectStatus::Unknown => "Unknown",
        }
    }

    /// Parses the stored column value. Anything unexpected reads back as `Unknown`.
    pub fn from_stored(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
            .unwrap_or(ProjectStatus::Unknown)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Builds coordinates only when both values are finite and on the globe.
    pub fn checked(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then(|| Self::new(latitude, longitude))
    }
}

/// Canonical project record keyed by `(source, project_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub source: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    /// Verbatim status text from the source, before vocabulary mapping.
    pub source_status: String,
    pub address: String,
    pub application_date: NaiveDate,
    pub collection_date: NaiveDate,
    /// Set when `application_date` was substituted with `collection_date`.
    #[serde(skip)]
    pub date_is_fallback: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// True when the coordinates are the configured fallback point.
    pub location_approximate: bool,
    pub url: Option<String>,
    pub raw_data: JsonValue,
}

impl ProjectRecord {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        }
    }

    pub fn set_coordinates(&mut self, coords: Option<Coordinates>) {
        self.latitude = coords.map(|c| c.latitude);
        self.longitude = coords.map(|c| c.longitude);
    }
}

/// Stored project row as read back by the dashboard and status views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProject {
    #[serde(flatten)]
    pub record: ProjectRecord,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::PartiallyFailed => "PartiallyFailed",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "Running" => Some(RunStatus::Running),
            "Succeeded" => Some(RunStatus::Succeeded),
            "PartiallyFailed" => Some(RunStatus::PartiallyFailed),
            "Failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run counters. `records_written = inserted + updated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunTally {
    pub records_seen: u32,
    pub records_written: u32,
    pub records_inserted: u32,
    pub records_updated: u32,
    pub records_excluded: u32,
    pub normalize_failures: u32,
    pub store_failures: u32,
    pub geocode_failures: u32,
}

impl RunTally {
    pub fn record_write(&mut self, outcome: UpsertOutcome) {
        self.records_written += 1;
        match outcome {
            UpsertOutcome::Inserted => self.records_inserted += 1,
            UpsertOutcome::Updated => self.records_updated += 1,
        }
    }

    pub fn record_failures(&self) -> u32 {
        self.normalize_failures + self.store_failures
    }

    /// Terminal status for a run whose fetch step succeeded.
    pub fn completed_status(&self) -> RunStatus {
        if self.record_failures() > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub tally: RunTally,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub query_key: String,
    pub coordinates: Coordinates,
    pub resolved_at: DateTime<Utc>,
}

/// Cache key for an address or parcel query: trimmed, single-spaced, upper-case.
pub fn normalize_query_key(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
