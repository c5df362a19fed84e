//! Template configuration manager: priority override across the three file
//! layers, defaults resolution, caching and reload.

mod common;

use common::test_instance_config;
use hostbroker::config::{BrokerConfig, ProviderTypeDefaults};
use hostbroker::templates::TemplateManager;
use serde_json::json;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, value: serde_json::Value) {
    std::fs::write(dir.path().join(name), serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn manager_config(dir: &TempDir) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.provider.providers = vec![test_instance_config("aws-us-east-1")];
    config.template.config_dir = dir.path().to_path_buf();
    config
}

#[tokio::test]
async fn instance_file_overrides_type_file_overrides_main() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "templates.json",
        json!({"t1": {
            "provider_api": "EC2Fleet",
            "subnet_ids": ["subnet-a"],
            "image_id": "ami-main",
            "max_instances": 10
        }}),
    );
    write(
        &dir,
        "awsprov_templates.json",
        json!({"t1": {"max_instances": 20, "image_id": "ami-aws"}}),
    );
    write(
        &dir,
        "aws-us-east-1_templates.json",
        json!({"t1": {"image_id": "ami-instance"}}),
    );

    let manager = TemplateManager::new(manager_config(&dir));
    let template = manager.get_template("t1").await.unwrap();

    assert_eq!(template.max_instances, 20);
    assert_eq!(template.image_id, "ami-instance");
    // Untouched lower-priority fields survive.
    assert_eq!(template.subnet_ids, vec!["subnet-a".to_string()]);
}

#[tokio::test]
async fn defaults_layer_under_explicit_fields() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "templates.json",
        json!({"t1": {
            "provider_api": "EC2Fleet",
            "subnet_ids": ["subnet-a"],
            "image_id": "ami-1"
        }}),
    );

    let mut config = manager_config(&dir);
    config.template.defaults = json!({"max_instances": 5, "instance_type": "t3.micro"});
    config.provider.provider_defaults.insert(
        "aws".to_string(),
        ProviderTypeDefaults { template_defaults: json!({"instance_type": "t3.large"}) },
    );
    config.provider.providers[0].template_defaults = json!({"key_name": "east-ops"});

    let manager = TemplateManager::new(config);
    let template = manager.get_template("t1").await.unwrap();

    // Global default survives where nothing overrides it.
    assert_eq!(template.max_instances, 5);
    // Provider-type default beats the global one.
    assert_eq!(template.instance_type.as_deref(), Some("t3.large"));
    // Instance default lands too.
    assert_eq!(template.aws.key_name.as_deref(), Some("east-ops"));
    // Explicit field always wins.
    assert_eq!(template.image_id, "ami-1");
}

#[tokio::test]
async fn invalid_templates_are_skipped_not_fatal() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "templates.json",
        json!({
            "good": {
                "provider_api": "EC2Fleet",
                "subnet_ids": ["subnet-a"],
                "image_id": "ami-1"
            },
            "bad": {
                "provider_api": "EC2Fleet",
                "subnet_ids": [],
                "image_id": "ami-1"
            }
        }),
    );

    let manager = TemplateManager::new(manager_config(&dir));
    let templates = manager.list_templates().await.unwrap();
    assert_eq!(templates.len(), 1);
    assert_eq!(templates[0].template_id, "good");
}

#[tokio::test]
async fn cached_snapshot_serves_until_reload() {
    let dir = TempDir::new().unwrap();
    write(
        &dir,
        "templates.json",
        json!({"t1": {
            "provider_api": "EC2Fleet",
            "subnet_ids": ["subnet-a"],
            "image_id": "ami-old"
        }}),
    );

    let manager = TemplateManager::new(manager_config(&dir));
    assert_eq!(manager.get_template("t1").await.unwrap().image_id, "ami-old");

    write(
        &dir,
        "templates.json",
        json!({"t1": {
            "provider_api": "EC2Fleet",
            "subnet_ids": ["subnet-a"],
            "image_id": "ami-new"
        }}),
    );

    // Cached snapshot still serves the old view...
    assert_eq!(manager.get_template("t1").await.unwrap().image_id, "ami-old");
    let stats = manager.cache_stats().await;
    assert!(stats.hits >= 1);

    // ...until an explicit reload.
    manager.reload().await.unwrap();
    assert_eq!(manager.get_template("t1").await.unwrap().image_id, "ami-new");
}

#[tokio::test]
async fn unknown_template_is_not_found() {
    let dir = TempDir::new().unwrap();
    write(&dir, "templates.json", json!({}));
    let manager = TemplateManager::new(manager_config(&dir));
    let err = manager.get_template("nope").await.unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");
}
