//! Raw source items → canonical `ProjectRecord`s.

use chrono::{Local, NaiveDate};
use devwatch_adapters::{RawItem, SourceAdapter};
use devwatch_core::{Coordinates, ProjectRecord, ProjectStatus};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("{source_id} item has no project identifier")]
    MissingIdentifier { source_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record {
        record: ProjectRecord,
        /// Addresses or parcels to try, in order, when the record has no coordinates.
        geocode_queries: Vec<String>,
    },
    Excluded { reason: &'static str },
}

const COMPLETE_WORDS: &[&str] = &["complete", "completed", "closed", "finaled", "final", "built"];
const ACTIVE_WORDS: &[&str] = &[
    "active",
    "open",
    "approved",
    "issued",
    "construction",
    "underway",
    "progress",
    "permitted",
];
const PENDING_WORDS: &[&str] = &[
    "pending",
    "submitted",
    "received",
    "review",
    "notice",
    "proposed",
    "hold",
    "deferred",
    "continued",
    "awaiting",
    "tbd",
];

/// Words that negate or cancel whatever else the status says.
const NEGATING_WORDS: &[&str] = &[
    "not", "denied", "withdrawn", "rejected", "revoked", "cancelled", "canceled", "expired",
];

/// Maps free-form status text onto the closed vocabulary.
///
/// Matching is per whole word, so "Incomplete" is not Complete. Any negating
/// word makes the status Unknown ("Not Approved"). Otherwise, when words from
/// several groups appear, Complete wins over Active, and Active over Pending.
pub fn map_status(raw: &str) -> ProjectStatus {
    let lowered = raw.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has_any = |vocab: &[&str]| words.iter().any(|w| vocab.contains(w));

    if has_any(NEGATING_WORDS) {
        ProjectStatus::Unknown
    } else if has_any(COMPLETE_WORDS) {
        ProjectStatus::Complete
    } else if has_any(ACTIVE_WORDS) {
        ProjectStatus::Active
    } else if has_any(PENDING_WORDS) {
        ProjectStatus::Pending
    } else {
        ProjectStatus::Unknown
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    collection_date: NaiveDate,
}

impl Normalizer {
    pub fn new(collection_date: NaiveDate) -> Self {
        Self { collection_date }
    }

    pub fn today() -> Self {
        Self::new(Local::now().date_naive())
    }

    pub fn normalize(
        &self,
        adapter: &dyn SourceAdapter,
        item: &RawItem,
    ) -> Result<Normalized, NormalizationError> {
        if let Some(reason) = adapter.exclusion_reason(item) {
            return Ok(Normalized::Excluded { reason });
        }

        let fields = adapter.extract(item);
        let project_id = fields
            .project_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NormalizationError::MissingIdentifier {
                source_id: adapter.source_id().to_string(),
            })?;

        let source_status = fields.status.unwrap_or_default();
        let (application_date, date_is_fallback) = match fields.application_date {
            Some(date) => (date, false),
            None => (self.collection_date, true),
        };
        let coordinates = match (fields.latitude, fields.longitude) {
            (Some(lat), Some(lon)) => Coordinates::checked(lat, lon),
            _ => None,
        };

        let mut record = ProjectRecord {
            source: adapter.source_id().to_string(),
            project_id,
            name: fields.name.unwrap_or_default(),
            description: fields.description.unwrap_or_default(),
            status: map_status(&source_status),
            source_status,
            address: fields.address.unwrap_or_default(),
            application_date,
            collection_date: self.collection_date,
            date_is_fallback,
            latitude: None,
            longitude: None,
            location_approximate: false,
            url: fields.url.filter(|u| !u.trim().is_empty()),
            raw_data: item.payload.clone(),
        };
        record.set_coordinates(coordinates);

        Ok(Normalized::Record {
            record,
            geocode_queries: fields.geocode_queries,
        })
    }
}
