//! Normalizes AWS instance descriptions into `Machine` records

use crate::aws::api::InstanceInfo;
use crate::domain::{Machine, MachineResult, Request};

pub struct MachineAdapter;

impl MachineAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Build a `Machine` for an instance materialized under `resource_id`.
    pub fn machine_from_instance(
        &self,
        info: &InstanceInfo,
        request: &Request,
        resource_id: &str,
    ) -> Machine {
        let price_type = match info.lifecycle.as_deref() {
            Some("spot") => "spot".to_string(),
            _ => "ondemand".to_string(),
        };
        Machine {
            machine_id: info.instance_id.clone(),
            instance_id: info.instance_id.clone(),
            request_id: request.request_id.clone(),
            template_id: request.template_id.clone(),
            resource_id: resource_id.to_string(),
            status: info.state.clone(),
            result: MachineResult::from_instance_state(&info.state),
            instance_type: info.instance_type.clone(),
            availability_zone: info.availability_zone.clone(),
            private_ip: info.private_ip.clone(),
            public_ip: info.public_ip.clone(),
            launch_time: info.launch_time,
            price_type: Some(price_type),
            provider_name: request.provider_name.clone(),
            provider_type: request.provider_type.clone(),
            provider_api: request.provider_api.clone(),
            tags: info.tags.clone(),
        }
    }
}

impl Default for MachineAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Request;

    #[test]
    fn spot_lifecycle_maps_to_spot_price_type() {
        let mut request = Request::new_acquisition("tmpl-1", 1).unwrap();
        request.record_provider("aws-us-east-1", "aws", "EC2Fleet");

        let info = InstanceInfo {
            instance_id: "i-1".into(),
            state: "running".into(),
            lifecycle: Some("spot".into()),
            ..InstanceInfo::default()
        };

        let machine = MachineAdapter::new().machine_from_instance(&info, &request, "fleet-1");
        assert_eq!(machine.machine_id, "i-1");
        assert_eq!(machine.price_type.as_deref(), Some("spot"));
        assert_eq!(machine.result, MachineResult::Succeed);
        assert_eq!(machine.provider_api.as_deref(), Some("EC2Fleet"));
        assert_eq!(machine.resource_id, "fleet-1");
    }
}
