//! Per-event-type identity strategies.

use crate::database::repositories::EventFilter;
use crate::domain::{EventType, IncompleteEvent};

/// Decides how events of one type are identified for deduplication and
/// which stored rows belong to the type.
pub trait EventTypeStrategy: Send + Sync {
    fn event_type(&self) -> &EventType;

    /// The dedup key stored as the event's `source_id`.
    fn source_id_for(&self, event: &IncompleteEvent) -> String {
        event.source_id.clone()
    }

    /// Query selecting every stored event of this type, across versions.
    fn all(&self) -> EventFilter {
        EventFilter::for_type(self.event_type().name.clone())
    }
}

/// Uses the source-assigned id as is.
#[derive(Debug, Clone)]
pub struct GenericEventTypeStrategy {
    event_type: EventType,
}

impl GenericEventTypeStrategy {
    pub fn new(event_type: EventType) -> Self {
        Self { event_type }
    }
}

impl EventTypeStrategy for GenericEventTypeStrategy {
    fn event_type(&self) -> &EventType {
        &self.event_type
    }
}
