//! End-to-end request lifecycle through the assembled application: command
//! bus, provider strategies over a fake AWS, unit-of-work commits, event
//! publication and the lifecycle poller.

mod common;

use async_trait::async_trait;
use common::{ec2_fleet_template, test_config, FakeAwsApi};
use hostbroker::app::commands::{CancelRequest, CreateAcquisitionRequest, CreateReturnRequest};
use hostbroker::app::events::EventHandler;
use hostbroker::app::queries::{GetMachinesByRequest, GetRequestStatus};
use hostbroker::app::wiring::{build_app, build_aws_strategy, App, StrategyFactory};
use hostbroker::config::BrokerConfig;
use hostbroker::domain::events::DomainEvent;
use hostbroker::domain::{Request, RequestStatus};
use hostbroker::error::Result;
use hostbroker::storage::MemoryRecordStore;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct EventRecorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        self.seen.lock().unwrap().push(event.kind_name().to_string());
        Ok(())
    }
}

fn fake_strategy_factory(api: Arc<FakeAwsApi>) -> StrategyFactory {
    Arc::new(move |instance, config| {
        let api = api.clone();
        Box::pin(async move { Ok(build_aws_strategy(&instance, &config, api)) })
    })
}

/// Build the app over a memory store, a fake AWS and a temp template dir.
async fn test_app(api: Arc<FakeAwsApi>, templates_dir: &TempDir) -> App {
    let mut config: BrokerConfig = test_config();
    config.template.config_dir = templates_dir.path().to_path_buf();

    build_app(config, None, Arc::new(MemoryRecordStore::new()), fake_strategy_factory(api))
        .await
        .unwrap()
}

fn write_templates(dir: &TempDir, value: serde_json::Value) {
    std::fs::write(
        dir.path().join("templates.json"),
        serde_json::to_string_pretty(&value).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn acquisition_happy_path_reaches_completed() {
    let dir = TempDir::new().unwrap();
    write_templates(&dir, json!({"ec2f-t": ec2_fleet_template("ec2f-t")}));

    let api = Arc::new(FakeAwsApi::new());
    *api.instant_instances.lock().unwrap() =
        vec!["i-1".to_string(), "i-2".to_string(), "i-3".to_string()];
    *api.fleet_instances.lock().unwrap() =
        vec!["i-1".to_string(), "i-2".to_string(), "i-3".to_string()];

    let app = test_app(api.clone(), &dir).await;
    let recorder = Arc::new(EventRecorder { seen: Mutex::new(Vec::new()) });
    app.core.event_bus.subscribe(recorder.clone()).await;

    let request_id =
        app.commands.execute(CreateAcquisitionRequest::new("ec2f-t", 3)).await.unwrap();

    // Dispatched and transitioned to processing with the fleet recorded.
    let view = app.queries.execute(GetRequestStatus { request_id: request_id.clone() }).await.unwrap();
    assert_eq!(view.request.status, RequestStatus::Processing);
    assert_eq!(view.request.resource_ids.len(), 1);
    assert!(view.request.resource_ids[0].starts_with("fleet-"));
    assert_eq!(view.request.provider_name.as_deref(), Some("aws-default"));

    {
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["RequestCreated".to_string(), "RequestStatusChanged".to_string()]
        );
    }

    // The poller syncs machines and completes the request.
    let synced = app.lifecycle.sync_request(&request_id).await.unwrap();
    assert_eq!(synced.status, RequestStatus::Completed);
    assert_eq!(synced.completed_machine_count, 3);
    assert_eq!(synced.get_progress_percentage(), 100.0);

    let machines =
        app.queries.execute(GetMachinesByRequest { request_id: request_id.clone() }).await.unwrap();
    assert_eq!(machines.len(), 3);
    let payload = machines[0].to_scheduler_payload();
    for key in ["machineId", "name", "result", "privateIpAddress", "publicIpAddress", "launchtime", "instanceType", "priceType"] {
        assert!(payload.get(key).is_some(), "missing scheduler key {key}");
    }

    // Completion emitted exactly once, in order.
    let seen = recorder.seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            "RequestCreated".to_string(),
            "RequestStatusChanged".to_string(),
            "RequestStatusChanged".to_string(),
            "RequestCompleted".to_string()
        ]
    );
}

#[tokio::test]
async fn return_request_releases_machines() {
    let dir = TempDir::new().unwrap();
    write_templates(&dir, json!({"ec2f-t": ec2_fleet_template("ec2f-t")}));

    let api = Arc::new(FakeAwsApi::new());
    *api.instant_instances.lock().unwrap() = vec!["i-1".to_string()];
    *api.fleet_instances.lock().unwrap() = vec!["i-1".to_string()];

    let app = test_app(api.clone(), &dir).await;
    let request_id =
        app.commands.execute(CreateAcquisitionRequest::new("ec2f-t", 1)).await.unwrap();
    app.lifecycle.sync_request(&request_id).await.unwrap();

    let return_id = app
        .commands
        .execute(CreateReturnRequest { machine_ids: vec!["i-1".to_string()], reason: Some("drain".into()) })
        .await
        .unwrap();

    let view = app.queries.execute(GetRequestStatus { request_id: return_id }).await.unwrap();
    assert_eq!(view.request.status, RequestStatus::Completed);

    // The fleet was deleted with termination and the machine marked dead.
    assert_eq!(api.calls_named("delete_fleet").len(), 1);
    let machines =
        app.queries.execute(GetMachinesByRequest { request_id }).await.unwrap();
    assert_eq!(machines[0].status, "terminated");
}

#[tokio::test]
async fn unknown_template_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_templates(&dir, json!({}));
    let app = test_app(Arc::new(FakeAwsApi::new()), &dir).await;

    let err =
        app.commands.execute(CreateAcquisitionRequest::new("missing", 1)).await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}

#[tokio::test]
async fn spot_on_run_instances_fails_capability_validation() {
    let dir = TempDir::new().unwrap();
    let mut doc = ec2_fleet_template("ri-spot");
    doc["provider_api"] = json!("RunInstances");
    doc["price_type"] = json!("spot");
    write_templates(&dir, json!({"ri-spot": doc}));

    let app = test_app(Arc::new(FakeAwsApi::new()), &dir).await;
    let err =
        app.commands.execute(CreateAcquisitionRequest::new("ri-spot", 1)).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert!(err.to_string().contains("does not support spot instances"));
}

#[tokio::test]
async fn capacity_shortfall_defers_and_later_retry_succeeds() {
    let dir = TempDir::new().unwrap();
    let mut doc = ec2_fleet_template("ri-t");
    doc["provider_api"] = json!("RunInstances");
    write_templates(&dir, json!({"ri-t": doc}));

    let api = Arc::new(FakeAwsApi::new());
    *api.run_instances_capacity_error.lock().unwrap() = true;

    let app = test_app(api.clone(), &dir).await;
    let request_id =
        app.commands.execute(CreateAcquisitionRequest::new("ri-t", 2)).await.unwrap();

    // Deferred: still pending, one retry burned.
    let view = app.queries.execute(GetRequestStatus { request_id: request_id.clone() }).await.unwrap();
    assert_eq!(view.request.status, RequestStatus::Pending);
    assert_eq!(view.request.retry_count, 1);

    // Capacity comes back; the poller re-dispatches.
    *api.run_instances_capacity_error.lock().unwrap() = false;
    let synced = app.lifecycle.sync_request(&request_id).await.unwrap();
    assert_eq!(synced.status, RequestStatus::Processing);
    assert!(synced.resource_ids[0].starts_with("r-"));
}

#[tokio::test]
async fn cancel_is_allowed_from_pending_and_rejected_after_completion() {
    let dir = TempDir::new().unwrap();
    write_templates(&dir, json!({}));
    let app = test_app(Arc::new(FakeAwsApi::new()), &dir).await;

    let mut pending = Request::new_acquisition("tmpl-x", 1).unwrap();
    let pending_id = pending.request_id.clone();
    pending.take_events();
    app.core.uow.requests().save(&pending).await.unwrap();

    let cancelled_id = app
        .commands
        .execute(CancelRequest { request_id: pending_id.clone(), reason: "operator".into() })
        .await
        .unwrap();
    assert_eq!(cancelled_id, pending_id);

    let view = app.queries.execute(GetRequestStatus { request_id: pending_id.clone() }).await.unwrap();
    assert_eq!(view.request.status, RequestStatus::Cancelled);

    // Cancelling again is an invalid transition.
    let err = app
        .commands
        .execute(CancelRequest { request_id: pending_id, reason: "again".into() })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_REQUEST_STATE");
}

#[tokio::test]
async fn timed_out_processing_request_fails_on_sync() {
    let dir = TempDir::new().unwrap();
    write_templates(&dir, json!({}));
    let app = test_app(Arc::new(FakeAwsApi::new()), &dir).await;

    let mut request = Request::new_acquisition("tmpl-x", 1).unwrap().with_timeout_minutes(0);
    request.take_events();
    request.start_processing().unwrap();
    request.take_events();
    let id = request.request_id.clone();
    app.core.uow.requests().save(&request).await.unwrap();

    let synced = app.lifecycle.sync_request(&id).await.unwrap();
    assert_eq!(synced.status, RequestStatus::Failed);
    assert!(synced.error_message.unwrap().contains("timed out"));
}
