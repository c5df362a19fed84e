//! Handler-level tests against a scripted AWS fake: the EC2Fleet happy
//! path, the ASG release call ordering, native-spec merge and the
//! RunInstances capacity surface.

mod common;

use common::{ec2_fleet_template, test_config, FakeAwsApi};
use hostbroker::aws::handlers::{AcquisitionLedger, AwsHandler};
use hostbroker::aws::{
    AsgHandler, AwsNativeSpecService, AwsOperations, Ec2FleetHandler, HandlerDeps,
    LaunchTemplateManager, MachineAdapter, RunInstancesHandler, SpotFleetHandler,
};
use hostbroker::domain::{Request, Template};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn deps(api: Arc<FakeAwsApi>) -> HandlerDeps {
    let config = test_config();
    HandlerDeps {
        ops: Arc::new(AwsOperations::new(
            api.clone(),
            &config.provider.circuit_breaker,
            &config.performance,
        )),
        launch_templates: Arc::new(LaunchTemplateManager::new(
            api.clone(),
            config.launch_template.clone(),
        )),
        native_spec: Arc::new(AwsNativeSpecService::new(
            true,
            PathBuf::from("/nonexistent"),
            "hostbroker".to_string(),
            "0.1.0".to_string(),
        )),
        machines: Arc::new(MachineAdapter::new()),
        ledger: Arc::new(AcquisitionLedger::new()),
    }
}

fn acquisition(template_id: &str, count: u32, api: &str) -> Request {
    let mut request = Request::new_acquisition(template_id, count).unwrap();
    request.record_provider("aws-default", "aws", api);
    request
}

#[tokio::test]
async fn ec2_fleet_happy_path_creates_launch_template_and_fleet() {
    let api = Arc::new(FakeAwsApi::new());
    *api.instant_instances.lock().unwrap() =
        vec!["i-1".to_string(), "i-2".to_string(), "i-3".to_string()];
    let handler = Ec2FleetHandler::new(deps(api.clone()));

    let template = Template::from_value(ec2_fleet_template("ec2f-t")).unwrap();
    let request = acquisition("ec2f-t", 3, "EC2Fleet");

    let outcome = handler.acquire_hosts(&request, &template).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.resource_ids.len(), 1);
    assert!(outcome.resource_ids[0].starts_with("fleet-"));
    assert_eq!(outcome.instances.len(), 3);

    // A launch template was created before the fleet.
    let names = api.call_names();
    let lt_pos = names.iter().position(|n| n == "create_launch_template").unwrap();
    let fleet_pos = names.iter().position(|n| n == "create_fleet").unwrap();
    assert!(lt_pos < fleet_pos);

    // CreateFleet carried the full capacity and the launch template binding.
    let fleet_config = &api.calls_named("create_fleet")[0];
    assert_eq!(fleet_config["TargetCapacitySpecification"]["TotalTargetCapacity"], 3);
    assert_eq!(
        fleet_config["LaunchTemplateConfigs"][0]["LaunchTemplateSpecification"]
            ["LaunchTemplateId"],
        "lt-0abc"
    );
    assert_eq!(
        fleet_config["LaunchTemplateConfigs"][0]["Overrides"][0]["SubnetId"],
        "subnet-a"
    );
}

#[tokio::test]
async fn ec2_fleet_acquire_is_idempotent_per_request() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = Ec2FleetHandler::new(deps(api.clone()));
    let template = Template::from_value(ec2_fleet_template("ec2f-t")).unwrap();
    let request = acquisition("ec2f-t", 2, "EC2Fleet");

    let first = handler.acquire_hosts(&request, &template).await.unwrap();
    let second = handler.acquire_hosts(&request, &template).await.unwrap();

    assert_eq!(first.resource_ids, second.resource_ids);
    // Only one fleet was ever created.
    assert_eq!(api.calls_named("create_fleet").len(), 1);
}

#[tokio::test]
async fn native_spec_renders_and_handler_overlays_launch_template() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = Ec2FleetHandler::new(deps(api.clone()));

    let mut doc = ec2_fleet_template("spec-t");
    doc["provider_api_spec"] = json!({
        "Type": "instant",
        "TargetCapacitySpecification": {"TotalTargetCapacity": "{{ requested_count }}"}
    });
    let template = Template::from_value(doc).unwrap();
    let request = acquisition("spec-t", 5, "EC2Fleet");

    handler.acquire_hosts(&request, &template).await.unwrap();

    let fleet_config = &api.calls_named("create_fleet")[0];
    // Rendered operator value survives...
    assert_eq!(fleet_config["TargetCapacitySpecification"]["TotalTargetCapacity"], "5");
    assert_eq!(fleet_config["Type"], "instant");
    // ...and the handler still injected the launch template binding.
    assert_eq!(
        fleet_config["LaunchTemplateConfigs"][0]["LaunchTemplateSpecification"]
            ["LaunchTemplateId"],
        "lt-0abc"
    );
}

#[tokio::test]
async fn asg_release_reduces_detaches_then_terminates() {
    let api = Arc::new(FakeAwsApi::new());
    *api.asg.lock().unwrap() = Some(hostbroker::aws::api::AsgInfo {
        name: "hf-req-1".to_string(),
        desired_capacity: 5,
        min_size: 0,
        max_size: 10,
        instance_ids: vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
    });
    let handler = AsgHandler::new(deps(api.clone()), "hostbroker".to_string());

    let mut request = acquisition("asg-t", 5, "ASG");
    request.add_resource_id("hf-req-1");
    request.add_machine_reference("m1");
    request.add_machine_reference("m2");

    handler.release_hosts(&request).await.unwrap();

    let names = api.call_names();
    let update_pos = names.iter().position(|n| n == "update_auto_scaling_group").unwrap();
    let detach_pos = names.iter().position(|n| n == "detach_instances").unwrap();
    let terminate_pos = names.iter().position(|n| n == "terminate_instances").unwrap();
    assert!(update_pos < detach_pos && detach_pos < terminate_pos);

    let update = &api.calls_named("update_auto_scaling_group")[0];
    assert_eq!(update["desired_capacity"], 3);

    let detach = &api.calls_named("detach_instances")[0];
    assert_eq!(detach["instance_ids"], json!(["m1", "m2"]));
    assert_eq!(detach["decrement_desired_capacity"], true);

    let terminate = &api.calls_named("terminate_instances")[0];
    assert_eq!(terminate["instance_ids"], json!(["m1", "m2"]));
}

#[tokio::test]
async fn asg_release_without_machines_force_deletes_the_group() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = AsgHandler::new(deps(api.clone()), "hostbroker".to_string());

    let mut request = acquisition("asg-t", 2, "ASG");
    request.add_resource_id("hf-req-2");

    handler.release_hosts(&request).await.unwrap();

    let delete = &api.calls_named("delete_auto_scaling_group")[0];
    assert_eq!(delete["name"], "hf-req-2");
    assert_eq!(delete["force_delete"], true);
    assert!(api.calls_named("detach_instances").is_empty());
}

#[tokio::test]
async fn asg_acquire_names_group_after_request_and_tags_it() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = AsgHandler::new(deps(api.clone()), "hostbroker".to_string());

    let template = Template::from_value(ec2_fleet_template("asg-t")).unwrap();
    let request = acquisition("asg-t", 4, "ASG");

    let outcome = handler.acquire_hosts(&request, &template).await.unwrap();
    assert_eq!(outcome.resource_ids, vec![format!("hf-{}", request.request_id)]);

    let config = &api.calls_named("create_auto_scaling_group")[0];
    assert_eq!(config["MinSize"], 0);
    assert_eq!(config["DesiredCapacity"], 4);
    assert_eq!(config["MaxSize"], 8);
    assert_eq!(config["VPCZoneIdentifier"], "subnet-a");

    let tags = &api.calls_named("create_or_update_asg_tags")[0];
    let keys: Vec<&str> =
        tags.as_array().unwrap().iter().map(|t| t["key"].as_str().unwrap()).collect();
    assert!(keys.contains(&"RequestId"));
    assert!(keys.contains(&"CreatedBy"));
    assert!(keys.contains(&"ProviderApi"));
}

#[tokio::test]
async fn spot_fleet_requires_fleet_role_and_cancels_with_termination() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = SpotFleetHandler::new(deps(api.clone()));

    let mut doc = ec2_fleet_template("spot-t");
    doc["provider_api"] = json!("SpotFleet");
    let template = Template::from_value(doc.clone()).unwrap();
    let request = acquisition("spot-t", 2, "SpotFleet");

    // Without a fleet role the acquisition is rejected up front.
    let err = handler.acquire_hosts(&request, &template).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    doc["fleet_role"] = json!("arn:aws:iam::123456789012:role/fleet");
    let template = Template::from_value(doc).unwrap();
    let outcome = handler.acquire_hosts(&request, &template).await.unwrap();
    assert!(outcome.resource_ids[0].starts_with("sfr-"));

    let spot_config = &api.calls_named("request_spot_fleet")[0];
    assert_eq!(spot_config["IamFleetRole"], "arn:aws:iam::123456789012:role/fleet");
    assert_eq!(spot_config["TargetCapacity"], 2);

    let mut release_request = acquisition("spot-t", 2, "SpotFleet");
    release_request.add_resource_id(&outcome.resource_ids[0]);
    release_request.add_machine_reference("i-leak");
    handler.release_hosts(&release_request).await.unwrap();

    let cancel = &api.calls_named("cancel_spot_fleet_requests")[0];
    assert_eq!(cancel["terminate_instances"], true);
    let terminate = &api.calls_named("terminate_instances")[0];
    assert_eq!(terminate["instance_ids"], json!(["i-leak"]));
}

#[tokio::test]
async fn run_instances_sets_min_max_and_surfaces_capacity_errors() {
    let api = Arc::new(FakeAwsApi::new());
    let handler = RunInstancesHandler::new(deps(api.clone()));

    let mut doc = ec2_fleet_template("ri-t");
    doc["provider_api"] = json!("RunInstances");
    let template = Template::from_value(doc).unwrap();
    let request = acquisition("ri-t", 2, "RunInstances");

    let outcome = handler.acquire_hosts(&request, &template).await.unwrap();
    assert!(outcome.resource_ids[0].starts_with("r-"));
    assert_eq!(outcome.instances.len(), 2);

    let config = &api.calls_named("run_instances")[0];
    assert_eq!(config["MinCount"], 2);
    assert_eq!(config["MaxCount"], 2);

    // Capacity errors stay recoverable.
    *api.run_instances_capacity_error.lock().unwrap() = true;
    let request2 = acquisition("ri-t", 2, "RunInstances");
    let err = handler.acquire_hosts(&request2, &template).await.unwrap_err();
    assert_eq!(err.error_code(), "INSUFFICIENT_CAPACITY");
}
