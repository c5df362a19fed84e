//! Request aggregate
//!
//! The aggregate root for acquisition (NEW) and return (RETURN) requests.
//! State is mutated only through transition methods; every transition either
//! emits domain events or fails with `InvalidRequestState` and leaves the
//! aggregate untouched. Re-applying a terminal transition is a hard error,
//! never silent.

use crate::domain::events::{DomainEvent, DomainEventKind};
use crate::error::{BrokerError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MINUTES: i64 = 60;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_PRIORITY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "RETURN")]
    Return,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::New => f.write_str("NEW"),
            RequestType::Return => f.write_str("RETURN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub template_id: Option<String>,
    pub request_type: RequestType,
    pub machine_count: u32,
    pub requester_id: Option<String>,
    pub priority: u8,
    pub status: RequestStatus,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub timeout_minutes: i64,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Opaque provider-side handles (fleet id, ASG name, reservation id).
    #[serde(default)]
    pub resource_ids: Vec<String>,
    /// Machine ids owned by this request.
    #[serde(default)]
    pub machine_references: Vec<String>,
    pub provider_name: Option<String>,
    pub provider_type: Option<String>,
    pub provider_api: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completion_message: Option<String>,
    pub error_message: Option<String>,
    pub return_reason: Option<String>,
    pub completed_machine_count: u32,

    #[serde(skip)]
    events: Vec<DomainEvent>,
    #[serde(default)]
    event_sequence: u64,
}

impl Request {
    /// Create a NEW (acquisition) request in `pending`.
    pub fn new_acquisition(template_id: &str, machine_count: u32) -> Result<Self> {
        if machine_count == 0 {
            return Err(BrokerError::Validation {
                field: "machine_count".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if template_id.is_empty() {
            return Err(BrokerError::Validation {
                field: "template_id".to_string(),
                reason: "required for acquisition requests".to_string(),
            });
        }

        let mut request = Self::base(RequestType::New, machine_count);
        request.template_id = Some(template_id.to_string());
        let event = request.next_event(DomainEventKind::RequestCreated {
            template_id: Some(template_id.to_string()),
            request_type: RequestType::New.to_string(),
            machine_count,
        });
        request.events.push(event);
        Ok(request)
    }

    /// Create a RETURN request for a set of machines.
    pub fn new_return(machine_ids: Vec<String>, reason: Option<String>) -> Result<Self> {
        if machine_ids.is_empty() {
            return Err(BrokerError::Validation {
                field: "machine_ids".to_string(),
                reason: "return requests need at least one machine".to_string(),
            });
        }

        let count = machine_ids.len() as u32;
        let mut request = Self::base(RequestType::Return, count);
        request.machine_references = machine_ids;
        request.return_reason = reason;
        let event = request.next_event(DomainEventKind::RequestCreated {
            template_id: None,
            request_type: RequestType::Return.to_string(),
            machine_count: count,
        });
        request.events.push(event);
        Ok(request)
    }

    fn base(request_type: RequestType, machine_count: u32) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            template_id: None,
            request_type,
            machine_count,
            requester_id: None,
            priority: DEFAULT_PRIORITY,
            status: RequestStatus::Pending,
            tags: HashMap::new(),
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            resource_ids: Vec::new(),
            machine_references: Vec::new(),
            provider_name: None,
            provider_type: None,
            provider_api: None,
            created_at: Utc::now(),
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            completion_message: None,
            error_message: None,
            return_reason: None,
            completed_machine_count: 0,
            events: Vec::new(),
            event_sequence: 0,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Result<Self> {
        if !(1..=5).contains(&priority) {
            return Err(BrokerError::Validation {
                field: "priority".to_string(),
                reason: format!("must be between 1 and 5, got {priority}"),
            });
        }
        self.priority = priority;
        Ok(self)
    }

    pub fn with_requester(mut self, requester_id: &str) -> Self {
        self.requester_id = Some(requester_id.to_string());
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: i64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    // -- transitions ---------------------------------------------------------

    /// `pending -> processing`
    pub fn start_processing(&mut self) -> Result<()> {
        self.ensure_transition(RequestStatus::Processing, &[RequestStatus::Pending])?;
        let old = self.status;
        self.status = RequestStatus::Processing;
        self.processing_started_at = Some(Utc::now());
        self.emit_status_changed(old, RequestStatus::Processing);
        Ok(())
    }

    /// `processing -> completed`
    pub fn complete_successfully(
        &mut self,
        machine_ids: Vec<String>,
        message: Option<String>,
    ) -> Result<()> {
        self.ensure_transition(RequestStatus::Completed, &[RequestStatus::Processing])?;
        let old = self.status;
        self.status = RequestStatus::Completed;
        self.completed_at = Some(Utc::now());
        for id in &machine_ids {
            self.add_machine_reference(id);
        }
        self.completion_message = message.clone();
        self.emit_status_changed(old, RequestStatus::Completed);
        let event = self.next_event(DomainEventKind::RequestCompleted {
            success: true,
            machine_ids,
            error_message: None,
            completion_message: message,
        });
        self.events.push(event);
        Ok(())
    }

    /// `processing -> failed`
    pub fn fail_with_error(&mut self, message: &str) -> Result<()> {
        self.ensure_transition(RequestStatus::Failed, &[RequestStatus::Processing])?;
        let old = self.status;
        self.status = RequestStatus::Failed;
        self.failed_at = Some(Utc::now());
        self.error_message = Some(message.to_string());
        self.emit_status_changed(old, RequestStatus::Failed);
        let event = self.next_event(DomainEventKind::RequestCompleted {
            success: false,
            machine_ids: Vec::new(),
            error_message: Some(message.to_string()),
            completion_message: None,
        });
        self.events.push(event);
        Ok(())
    }

    /// `pending|processing -> cancelled`
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        self.ensure_transition(
            RequestStatus::Cancelled,
            &[RequestStatus::Pending, RequestStatus::Processing],
        )?;
        let old = self.status;
        self.status = RequestStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
        self.return_reason = Some(reason.to_string());
        self.emit_status_changed(old, RequestStatus::Cancelled);
        Ok(())
    }

    fn ensure_transition(&self, attempted: RequestStatus, allowed_from: &[RequestStatus]) -> Result<()> {
        if allowed_from.contains(&self.status) {
            Ok(())
        } else {
            Err(BrokerError::InvalidRequestState {
                current: self.status.to_string(),
                attempted: attempted.to_string(),
            })
        }
    }

    // -- retry / timeout / progress ------------------------------------------

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry_count(&mut self, note: &str) -> Result<()> {
        if self.retry_count >= self.max_retries {
            return Err(BrokerError::RequestProcessing(format!(
                "retry limit reached ({}/{}): {note}",
                self.retry_count, self.max_retries
            )));
        }
        self.retry_count += 1;
        Ok(())
    }

    pub fn get_timeout_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(self.timeout_minutes)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        now >= self.get_timeout_at()
    }

    pub fn update_progress(&mut self, completed_count: u32, status_message: Option<String>) -> Result<()> {
        if completed_count > self.machine_count {
            return Err(BrokerError::Validation {
                field: "completed_machine_count".to_string(),
                reason: format!(
                    "{completed_count} exceeds requested machine count {}",
                    self.machine_count
                ),
            });
        }
        self.completed_machine_count = completed_count;
        if status_message.is_some() {
            self.completion_message = status_message;
        }
        Ok(())
    }

    pub fn get_progress_percentage(&self) -> f64 {
        if self.machine_count == 0 {
            return 0.0;
        }
        100.0 * f64::from(self.completed_machine_count) / f64::from(self.machine_count)
    }

    // -- ownership -----------------------------------------------------------

    pub fn add_resource_id(&mut self, resource_id: &str) {
        if !self.resource_ids.iter().any(|r| r == resource_id) {
            self.resource_ids.push(resource_id.to_string());
        }
    }

    pub fn add_machine_reference(&mut self, machine_id: &str) {
        if !self.machine_references.iter().any(|m| m == machine_id) {
            self.machine_references.push(machine_id.to_string());
        }
    }

    pub fn record_provider(&mut self, name: &str, provider_type: &str, provider_api: &str) {
        self.provider_name = Some(name.to_string());
        self.provider_type = Some(provider_type.to_string());
        self.provider_api = Some(provider_api.to_string());
    }

    // -- events --------------------------------------------------------------

    fn next_event(&mut self, kind: DomainEventKind) -> DomainEvent {
        let event = DomainEvent::new(&self.request_id, self.event_sequence, kind);
        self.event_sequence += 1;
        event
    }

    fn emit_status_changed(&mut self, old: RequestStatus, new: RequestStatus) {
        let event = self.next_event(DomainEventKind::RequestStatusChanged {
            old: old.to_string(),
            new: new.to_string(),
        });
        self.events.push(event);
    }

    /// Drain buffered events; called exactly once per commit by the UoW.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_events(&self) -> &[DomainEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new_acquisition("tmpl-1", 3).unwrap()
    }

    #[test]
    fn acquisition_starts_pending_with_created_event() {
        let r = request();
        assert_eq!(r.status, RequestStatus::Pending);
        assert_eq!(r.pending_events().len(), 1);
        assert_eq!(r.pending_events()[0].kind_name(), "RequestCreated");
    }

    #[test]
    fn machine_count_zero_is_rejected() {
        assert!(Request::new_acquisition("tmpl-1", 0).is_err());
        assert!(Request::new_acquisition("tmpl-1", 1).is_ok());
    }

    #[test]
    fn return_request_requires_machines() {
        assert!(Request::new_return(Vec::new(), None).is_err());
        let r = Request::new_return(vec!["m-1".into()], Some("host drain".into())).unwrap();
        assert_eq!(r.request_type, RequestType::Return);
        assert_eq!(r.machine_count, 1);
    }

    #[test]
    fn priority_bounds() {
        assert!(request().with_priority(0).is_err());
        assert!(request().with_priority(6).is_err());
        assert!(request().with_priority(1).is_ok());
        assert!(request().with_priority(5).is_ok());
    }

    #[test]
    fn happy_path_transitions_emit_ordered_events() {
        let mut r = request();
        r.start_processing().unwrap();
        r.complete_successfully(vec!["m-1".into(), "m-2".into()], Some("done".into())).unwrap();

        assert_eq!(r.status, RequestStatus::Completed);
        assert!(r.completed_at.is_some());
        assert_eq!(r.machine_references, vec!["m-1".to_string(), "m-2".to_string()]);

        let events = r.take_events();
        let names: Vec<_> = events.iter().map(|e| e.kind_name()).collect();
        assert_eq!(
            names,
            vec!["RequestCreated", "RequestStatusChanged", "RequestStatusChanged", "RequestCompleted"]
        );
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert!(events.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));

        // Drained exactly once
        assert!(r.take_events().is_empty());
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        let mut r = request();
        let err = r.complete_successfully(vec![], None).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST_STATE");
        assert_eq!(r.status, RequestStatus::Pending);

        r.start_processing().unwrap();
        r.fail_with_error("capacity exhausted").unwrap();
        assert_eq!(r.status, RequestStatus::Failed);

        // Terminal transitions are hard errors, never silent
        assert!(r.fail_with_error("again").is_err());
        assert!(r.start_processing().is_err());
        assert_eq!(r.status, RequestStatus::Failed);
    }

    #[test]
    fn double_complete_is_rejected() {
        let mut r = request();
        r.start_processing().unwrap();
        r.complete_successfully(vec!["m-1".into()], None).unwrap();
        let err = r.complete_successfully(vec!["m-2".into()], None).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidRequestState { .. }));
    }

    #[test]
    fn cancel_from_pending_and_processing_only() {
        let mut r = request();
        r.cancel("operator request").unwrap();
        assert_eq!(r.status, RequestStatus::Cancelled);
        assert!(r.cancelled_at.is_some());

        let mut r2 = request();
        r2.start_processing().unwrap();
        r2.cancel("drain").unwrap();
        assert_eq!(r2.status, RequestStatus::Cancelled);

        let mut r3 = request();
        r3.start_processing().unwrap();
        r3.complete_successfully(vec![], None).unwrap();
        assert!(r3.cancel("late").is_err());
    }

    #[test]
    fn retry_count_never_exceeds_max() {
        let mut r = request();
        r.max_retries = 2;
        assert!(r.can_retry());
        r.increment_retry_count("attempt 1").unwrap();
        r.increment_retry_count("attempt 2").unwrap();
        assert!(!r.can_retry());
        assert!(r.increment_retry_count("attempt 3").is_err());
        assert_eq!(r.retry_count, 2);
    }

    #[test]
    fn timeout_is_a_pure_function_of_time() {
        let r = request().with_timeout_minutes(30);
        assert!(!r.is_timed_out(r.created_at + Duration::minutes(29)));
        assert!(r.is_timed_out(r.created_at + Duration::minutes(30)));
    }

    #[test]
    fn progress_is_clamped_by_machine_count() {
        let mut r = request();
        r.update_progress(2, Some("2 of 3 running".into())).unwrap();
        assert!((r.get_progress_percentage() - 66.666).abs() < 0.01);
        assert!(r.update_progress(4, None).is_err());
        assert_eq!(r.completed_machine_count, 2);
    }

    #[test]
    fn resource_ids_deduplicate() {
        let mut r = request();
        r.add_resource_id("fleet-1");
        r.add_resource_id("fleet-1");
        r.add_resource_id("fleet-2");
        assert_eq!(r.resource_ids, vec!["fleet-1".to_string(), "fleet-2".to_string()]);
    }
}
