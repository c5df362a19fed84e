//! Domain events
//!
//! Immutable records of something that happened inside an aggregate. Events
//! carry a unique id, a wall-clock timestamp and a per-aggregate sequence
//! number; within one aggregate the emission order is preserved all the way
//! to the event publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    /// Correlation key: the aggregate (request) this event belongs to.
    pub request_id: String,
    /// Monotonic per-aggregate emission sequence.
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: DomainEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum DomainEventKind {
    RequestCreated {
        template_id: Option<String>,
        request_type: String,
        machine_count: u32,
    },
    RequestStatusChanged {
        old: String,
        new: String,
    },
    RequestCompleted {
        success: bool,
        machine_ids: Vec<String>,
        error_message: Option<String>,
        completion_message: Option<String>,
    },
}

impl DomainEvent {
    pub fn new(request_id: &str, sequence: u64, kind: DomainEventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            request_id: request_id.to_string(),
            sequence,
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DomainEventKind::RequestCreated { .. } => "RequestCreated",
            DomainEventKind::RequestStatusChanged { .. } => "RequestStatusChanged",
            DomainEventKind::RequestCompleted { .. } => "RequestCompleted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_unique_and_ordered() {
        let a = DomainEvent::new(
            "req-1",
            0,
            DomainEventKind::RequestStatusChanged { old: "pending".into(), new: "processing".into() },
        );
        let b = DomainEvent::new(
            "req-1",
            1,
            DomainEventKind::RequestCompleted {
                success: true,
                machine_ids: vec!["m-1".into()],
                error_message: None,
                completion_message: None,
            },
        );
        assert_ne!(a.event_id, b.event_id);
        assert!(a.sequence < b.sequence);
        assert!(a.occurred_at <= b.occurred_at);
    }
}
