//! Event database model.

use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Event, EventType};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct EventDbModel {
    pub id: i64,
    pub type_name: String,
    pub type_version: i64,
    pub source_id: String,
    pub time: i64,
    pub to_id: i64,
    pub from_id: Option<i64>,
    pub amount: f64,
    /// JSON blob
    pub details: Option<String>,
    pub size: Option<i64>,
}

impl EventDbModel {
    pub fn into_event(self) -> Result<Event> {
        let details = self
            .details
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()?;
        Ok(Event {
            id: self.id,
            time: ms_to_datetime(self.time),
            event_type: EventType::new(self.type_name, self.type_version as u32),
            source_id: self.source_id,
            to_artifact_id: self.to_id,
            from_artifact_id: self.from_id,
            amount: self.amount,
            details,
            size: self.size,
        })
    }
}

/// Row to be written by a flush. `id` is only meaningful for overwrites.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub id: Option<i64>,
    pub type_name: String,
    pub type_version: i64,
    pub source_id: String,
    pub time: i64,
    pub to_id: i64,
    pub from_id: Option<i64>,
    pub amount: f64,
    pub details: Option<String>,
    pub size: Option<i64>,
}

impl EventRow {
    pub fn from_parts(
        event: &crate::domain::IncompleteEvent,
        source_id: String,
        to_id: i64,
        from_id: Option<i64>,
    ) -> Result<Self> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            id: None,
            type_name: event.event_type.name.clone(),
            type_version: i64::from(event.event_type.version),
            source_id,
            time: datetime_to_ms(event.time),
            to_id,
            from_id,
            amount: event.amount,
            details,
            size: event.size,
        })
    }
}
