//! Request lifecycle poller
//!
//! The external poller that drives asynchronous requests forward: it
//! re-dispatches deferred acquisitions, syncs machine inventory from the
//! provider, updates progress as instances reach `running`, completes
//! requests when the full count is live and fails them on timeout. All
//! request mutation on the status path happens here, keeping the query
//! surface side-effect free.

use crate::app::commands::dispatch_acquisition;
use crate::app::wiring::AppCore;
use crate::domain::{Machine, MachineResult, Request, RequestStatus, RequestType};
use crate::error::{BrokerError, Result};
use crate::provider::{OperationType, ProviderOperation};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RequestLifecycleService {
    core: Arc<AppCore>,
}

impl RequestLifecycleService {
    pub fn new(core: Arc<AppCore>) -> Self {
        Self { core }
    }

    /// Advance one request. Returns the refreshed aggregate.
    pub async fn sync_request(&self, request_id: &str) -> Result<Request> {
        let uow = self.core.uow.begin_for_request(request_id).await;
        let mut request = self
            .core
            .uow
            .requests()
            .get_by_id(request_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound {
                entity: "request".to_string(),
                id: request_id.to_string(),
            })?;

        if request.status.is_terminal() {
            uow.rollback().await;
            return Ok(request);
        }

        if request.is_timed_out(Utc::now()) {
            if request.status == RequestStatus::Pending {
                request.start_processing()?;
            }
            request.fail_with_error(&format!(
                "timed out after {} minutes",
                request.timeout_minutes
            ))?;
            uow.stage_request(&mut request).await?;
            uow.commit().await?;
            warn!("Request {} timed out", request_id);
            return Ok(request);
        }

        match (request.status, request.request_type) {
            (RequestStatus::Pending, RequestType::New) => {
                // Deferred acquisition: re-dispatch. The handler-side ledger
                // makes a duplicate dispatch return the recorded resources.
                let template = match &request.template_id {
                    Some(id) => self.core.templates.get_template(id).await?,
                    None => {
                        uow.rollback().await;
                        return Err(BrokerError::Validation {
                            field: "template_id".to_string(),
                            reason: "acquisition request without template".to_string(),
                        });
                    }
                };
                dispatch_acquisition(&self.core, &mut request, &template).await?;
                uow.stage_request(&mut request).await?;
                uow.commit().await?;
            }
            (RequestStatus::Processing, RequestType::New) => {
                let machines = self.fetch_machines(&request).await?;
                self.apply_machine_sync(&mut request, &machines)?;
                for machine in &machines {
                    uow.stage_machine(machine).await?;
                }
                uow.stage_request(&mut request).await?;
                uow.commit().await?;
            }
            _ => {
                uow.rollback().await;
            }
        }

        Ok(request)
    }

    /// Sync every non-terminal request once. Requests sync concurrently up
    /// to `performance.max_workers` when parallelism is enabled; aggregate
    /// locks still serialize work on any single request id.
    pub async fn sync_all(&self) -> Result<usize> {
        let open = self
            .core
            .uow
            .requests()
            .find_by(|r: &Request| !r.status.is_terminal())
            .await?;
        let (parallel, max_workers) = {
            let config = self.core.config.read().await;
            (config.performance.enable_parallel, config.performance.max_workers.max(1))
        };
        let concurrency = if parallel { max_workers } else { 1 };

        let results = futures::stream::iter(open.into_iter().map(|request| async move {
            let id = request.request_id.clone();
            (id.clone(), self.sync_request(&id).await)
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        let mut synced = 0;
        for (id, result) in results {
            match result {
                Ok(_) => synced += 1,
                Err(e) => warn!("Sync of request {} failed: {}", id, e),
            }
        }
        Ok(synced)
    }

    async fn fetch_machines(&self, request: &Request) -> Result<Vec<Machine>> {
        let operation = ProviderOperation::new(
            OperationType::GetInstanceStatus,
            json!({ "request": request }),
        )
        .with_correlation_id(&request.request_id);
        let instance_name = request.provider_name.clone().unwrap_or_default();
        let result =
            self.core.provider_context.execute_with_strategy(&instance_name, operation).await;
        if !result.success {
            return Err(BrokerError::infrastructure(
                result.error_message.unwrap_or_else(|| "status check failed".to_string()),
            ));
        }
        let machines = result
            .data
            .and_then(|mut d| d.get_mut("machines").map(serde_json::Value::take))
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(machines)?)
    }

    /// Progress accounting: `completed_machine_count` is owned by this
    /// poller and advances as instances reach `running`.
    fn apply_machine_sync(&self, request: &mut Request, machines: &[Machine]) -> Result<()> {
        for machine in machines {
            request.add_machine_reference(&machine.machine_id);
        }
        let running: Vec<String> = machines
            .iter()
            .filter(|m| m.result == MachineResult::Succeed)
            .map(|m| m.machine_id.clone())
            .collect();
        let running_count = (running.len() as u32).min(request.machine_count);
        if running_count > request.completed_machine_count {
            request.update_progress(
                running_count,
                Some(format!("{running_count}/{} machines running", request.machine_count)),
            )?;
        }
        if running_count >= request.machine_count {
            request.complete_successfully(
                running,
                Some(format!("all {} machines running", request.machine_count)),
            )?;
            info!("Request {} completed", request.request_id);
        }
        Ok(())
    }
}
