//! Events recorded against artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ArtifactKey;

/// Named, versioned event type (e.g. `COMMIT_CODE` v1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType {
    pub name: String,
    pub version: u32,
}

impl EventType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:v{}", self.name, self.version)
    }
}

/// An event produced by a collector that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncompleteEvent {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Identifier assigned by the external source; dedup key together with the type.
    pub source_id: String,
    pub to: ArtifactKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ArtifactKey>,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

impl IncompleteEvent {
    pub fn new(
        time: DateTime<Utc>,
        event_type: EventType,
        source_id: impl Into<String>,
        to: ArtifactKey,
        amount: f64,
    ) -> Self {
        Self {
            time,
            event_type,
            source_id: source_id.into(),
            to,
            from: None,
            amount,
            details: None,
            size: None,
        }
    }

    pub fn with_from(mut self, from: ArtifactKey) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    /// Artifacts referenced by this event.
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactKey> {
        std::iter::once(&self.to).chain(self.from.as_ref())
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source_id: String,
    pub to_artifact_id: i64,
    pub from_artifact_id: Option<i64>,
    pub amount: f64,
    pub details: Option<serde_json::Value>,
    pub size: Option<i64>,
}
