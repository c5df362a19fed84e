//! Launch template lifecycle
//!
//! Every AWS handler obtains its launch template through this manager. The
//! configuration decides whether templates are created per request or reused
//! by name, how names and versions are generated, and whether old versions
//! get pruned.

use crate::aws::api::{AwsApi, LaunchTemplateInfo};
use crate::config::{LaunchTemplateConfig, NamingStrategy, VersionStrategy};
use crate::domain::{Request, Template};
use crate::error::Result;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LaunchTemplateResult {
    pub template_id: String,
    pub template_name: String,
    pub version: String,
    pub created_new_template: bool,
}

pub struct LaunchTemplateManager {
    api: Arc<dyn AwsApi>,
    config: LaunchTemplateConfig,
}

impl LaunchTemplateManager {
    pub fn new(api: Arc<dyn AwsApi>, config: LaunchTemplateConfig) -> Self {
        Self { api, config }
    }

    /// Resolve the launch template for a request, creating or versioning as
    /// the configuration dictates.
    pub async fn create_or_update_launch_template(
        &self,
        template: &Template,
        request: &Request,
    ) -> Result<LaunchTemplateResult> {
        // Operator-pinned launch template wins outright.
        if let Some(id) = &template.aws.launch_template_id {
            let version = template
                .aws
                .launch_template_version
                .clone()
                .unwrap_or_else(|| "$Latest".to_string());
            debug!("Using operator-pinned launch template {} @ {}", id, version);
            return Ok(LaunchTemplateResult {
                template_id: id.clone(),
                template_name: String::new(),
                version,
                created_new_template: false,
            });
        }

        let name = self.template_name(template, request);
        let data = self.build_launch_template_data(template, request);
        let tags = self.launch_template_tags(template, request);

        if !self.config.create_per_request && self.config.reuse_existing {
            if let Some(existing) = self.api.describe_launch_template_by_name(&name).await? {
                let version = self.add_version(&existing, data).await?;
                self.maybe_cleanup_versions(&existing, version).await;
                return Ok(LaunchTemplateResult {
                    template_id: existing.template_id,
                    template_name: name,
                    version: version.to_string(),
                    created_new_template: false,
                });
            }
        }

        let created = self.api.create_launch_template(&name, data, tags).await?;
        info!("Created launch template {} ({})", name, created.template_id);
        Ok(LaunchTemplateResult {
            template_id: created.template_id,
            template_name: name,
            version: created.latest_version.to_string(),
            created_new_template: true,
        })
    }

    fn template_name(&self, template: &Template, request: &Request) -> String {
        if self.config.create_per_request {
            return format!("hf-lt-req-{}", request.request_id);
        }
        match self.config.naming_strategy {
            NamingStrategy::RequestBased => format!("hf-lt-req-{}", request.request_id),
            NamingStrategy::TemplateBased => format!("hf-lt-tmpl-{}", template.template_id),
        }
    }

    async fn add_version(&self, existing: &LaunchTemplateInfo, data: Value) -> Result<u64> {
        let mut data = data;
        if self.config.version_strategy == VersionStrategy::Timestamp {
            // Version numbers are AWS-assigned; the timestamp strategy stamps
            // the data so versions are distinguishable in the console.
            data["VersionDescription"] = json!(Utc::now().to_rfc3339());
        }
        self.api.create_launch_template_version(&existing.template_id, data).await
    }

    async fn maybe_cleanup_versions(&self, existing: &LaunchTemplateInfo, latest: u64) {
        if !self.config.cleanup_old_versions {
            return;
        }
        let keep = u64::from(self.config.max_versions_per_template.max(1));
        if latest <= keep {
            return;
        }
        let stale: Vec<u64> = (1..=latest - keep).collect();
        if let Err(e) =
            self.api.delete_launch_template_versions(&existing.template_id, stale.clone()).await
        {
            warn!(
                "Failed to prune {} old versions of {}: {}",
                stale.len(),
                existing.template_id,
                e
            );
        }
    }

    fn launch_template_tags(&self, template: &Template, request: &Request) -> HashMap<String, String> {
        let mut tags = template.tags.clone();
        tags.insert("RequestId".to_string(), request.request_id.clone());
        tags.insert("TemplateId".to_string(), template.template_id.clone());
        tags
    }

    /// Assemble `LaunchTemplateData` from the template fields.
    pub fn build_launch_template_data(&self, template: &Template, request: &Request) -> Value {
        let mut data = serde_json::Map::new();
        data.insert("ImageId".to_string(), json!(template.image_id));
        if let Some((instance_type, _)) = template.weighted_instance_types().first() {
            data.insert("InstanceType".to_string(), json!(instance_type));
        }
        if let Some(key_name) = &template.aws.key_name {
            data.insert("KeyName".to_string(), json!(key_name));
        }
        if let Some(user_data) = &template.aws.user_data {
            let encoded = base64::engine::general_purpose::STANDARD.encode(user_data.as_bytes());
            data.insert("UserData".to_string(), json!(encoded));
        }
        if let Some(profile) = &template.aws.instance_profile {
            data.insert("IamInstanceProfile".to_string(), json!({ "Name": profile }));
        }

        // Public IP assignment moves the security groups onto the interface;
        // AWS rejects both top-level groups and interface groups together.
        if template.aws.assign_public_ip == Some(true) {
            data.insert(
                "NetworkInterfaces".to_string(),
                json!([{
                    "DeviceIndex": 0,
                    "AssociatePublicIpAddress": true,
                    "SubnetId": template.subnet_ids.first(),
                    "Groups": template.security_group_ids,
                }]),
            );
        } else if !template.security_group_ids.is_empty() {
            data.insert("SecurityGroupIds".to_string(), json!(template.security_group_ids));
        }

        if template.aws.root_device_volume_size.is_some()
            || template.aws.volume_type.is_some()
            || template.aws.iops.is_some()
        {
            let mut ebs = serde_json::Map::new();
            if let Some(size) = template.aws.root_device_volume_size {
                ebs.insert("VolumeSize".to_string(), json!(size));
            }
            if let Some(volume_type) = &template.aws.volume_type {
                ebs.insert("VolumeType".to_string(), json!(volume_type));
            }
            if let Some(iops) = template.aws.iops {
                ebs.insert("Iops".to_string(), json!(iops));
            }
            ebs.insert("DeleteOnTermination".to_string(), json!(true));
            data.insert(
                "BlockDeviceMappings".to_string(),
                json!([{ "DeviceName": "/dev/xvda", "Ebs": ebs }]),
            );
        }

        let mut instance_tags: Vec<Value> = template
            .tags
            .iter()
            .map(|(k, v)| json!({"Key": k, "Value": v}))
            .collect();
        instance_tags.push(json!({"Key": "RequestId", "Value": request.request_id}));
        instance_tags.push(json!({"Key": "TemplateId", "Value": template.template_id}));
        data.insert(
            "TagSpecifications".to_string(),
            json!([{ "ResourceType": "instance", "Tags": instance_tags }]),
        );

        Value::Object(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::api::MockAwsApi;
    use serde_json::json;

    fn template() -> Template {
        Template::from_value(json!({
            "template_id": "tmpl-1",
            "provider_api": "EC2Fleet",
            "image_id": "ami-1",
            "instance_type": "t3.micro",
            "subnet_ids": ["subnet-a"],
            "security_group_ids": ["sg-a"],
            "user_data": "#!/bin/sh\necho hello",
            "tags": {"team": "hpc"}
        }))
        .unwrap()
    }

    fn request() -> Request {
        Request::new_acquisition("tmpl-1", 2).unwrap()
    }

    fn lt_config() -> LaunchTemplateConfig {
        LaunchTemplateConfig::default()
    }

    #[tokio::test]
    async fn reuse_existing_creates_a_version_not_a_template() {
        let mut api = MockAwsApi::new();
        api.expect_describe_launch_template_by_name().times(1).returning(|_| {
            Ok(Some(LaunchTemplateInfo {
                template_id: "lt-123".into(),
                name: "hf-lt-req-x".into(),
                latest_version: 3,
                default_version: 1,
            }))
        });
        api.expect_create_launch_template_version().times(1).returning(|_, _| Ok(4));
        api.expect_create_launch_template().times(0);

        let manager = LaunchTemplateManager::new(Arc::new(api), lt_config());
        let result =
            manager.create_or_update_launch_template(&template(), &request()).await.unwrap();
        assert_eq!(result.template_id, "lt-123");
        assert_eq!(result.version, "4");
        assert!(!result.created_new_template);
    }

    #[tokio::test]
    async fn missing_template_is_created_once() {
        let mut api = MockAwsApi::new();
        api.expect_describe_launch_template_by_name().times(1).returning(|_| Ok(None));
        api.expect_create_launch_template().times(1).returning(|name, _, _| {
            Ok(LaunchTemplateInfo {
                template_id: "lt-new".into(),
                name: name.to_string(),
                latest_version: 1,
                default_version: 1,
            })
        });

        let manager = LaunchTemplateManager::new(Arc::new(api), lt_config());
        let result =
            manager.create_or_update_launch_template(&template(), &request()).await.unwrap();
        assert_eq!(result.template_id, "lt-new");
        assert!(result.created_new_template);
    }

    #[tokio::test]
    async fn pinned_launch_template_skips_aws_entirely() {
        let api = MockAwsApi::new();
        let mut t = template();
        t.aws.launch_template_id = Some("lt-pinned".into());
        t.aws.launch_template_version = Some("7".into());

        let manager = LaunchTemplateManager::new(Arc::new(api), lt_config());
        let result = manager.create_or_update_launch_template(&t, &request()).await.unwrap();
        assert_eq!(result.template_id, "lt-pinned");
        assert_eq!(result.version, "7");
        assert!(!result.created_new_template);
    }

    #[test]
    fn launch_template_data_carries_tags_and_user_data() {
        let manager = LaunchTemplateManager::new(Arc::new(MockAwsApi::new()), lt_config());
        let data = manager.build_launch_template_data(&template(), &request());

        assert_eq!(data["ImageId"], "ami-1");
        assert_eq!(data["InstanceType"], "t3.micro");
        // User data is base64-encoded
        let encoded = data["UserData"].as_str().unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert!(String::from_utf8(decoded).unwrap().starts_with("#!/bin/sh"));

        let tags = data["TagSpecifications"][0]["Tags"].as_array().unwrap();
        assert!(tags.iter().any(|t| t["Key"] == "RequestId"));
        assert!(tags.iter().any(|t| t["Key"] == "TemplateId"));
        assert!(tags.iter().any(|t| t["Key"] == "team"));
    }

    #[test]
    fn public_ip_moves_groups_to_the_interface() {
        let manager = LaunchTemplateManager::new(Arc::new(MockAwsApi::new()), lt_config());
        let mut t = template();
        t.aws.assign_public_ip = Some(true);
        let data = manager.build_launch_template_data(&t, &request());

        assert!(data.get("SecurityGroupIds").is_none());
        let iface = &data["NetworkInterfaces"][0];
        assert_eq!(iface["AssociatePublicIpAddress"], true);
        assert_eq!(iface["Groups"][0], "sg-a");
    }
}
