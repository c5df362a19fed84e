//! Machine entity and scheduler-facing payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scheduler-visible outcome of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineResult {
    Executing,
    Fail,
    Succeed,
}

impl MachineResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineResult::Executing => "executing",
            MachineResult::Fail => "fail",
            MachineResult::Succeed => "succeed",
        }
    }

    /// Map a cloud instance state to a scheduler result.
    pub fn from_instance_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "running" => MachineResult::Succeed,
            "pending" => MachineResult::Executing,
            "shutting-down" | "terminated" | "stopping" | "stopped" => MachineResult::Fail,
            _ => MachineResult::Executing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    /// Cloud-native instance id (e.g. `i-0abc...`).
    pub instance_id: String,
    pub request_id: String,
    pub template_id: Option<String>,
    /// The provider resource this machine materialized under.
    pub resource_id: String,
    pub status: String,
    pub result: MachineResult,
    pub instance_type: Option<String>,
    pub availability_zone: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub price_type: Option<String>,
    pub provider_name: Option<String>,
    pub provider_type: Option<String>,
    pub provider_api: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Machine {
    /// Render the exact machine payload the scheduler protocol expects.
    pub fn to_scheduler_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "machineId": self.machine_id,
            "name": self.tags.get("Name").cloned().unwrap_or_else(|| self.instance_id.clone()),
            "result": self.result.as_str(),
            "privateIpAddress": self.private_ip.clone().unwrap_or_default(),
            "publicIpAddress": self.public_ip.clone().unwrap_or_default(),
            "launchtime": self.launch_time.map(|t| t.timestamp()).unwrap_or(0),
            "instanceType": self.instance_type.clone().unwrap_or_default(),
            "priceType": self.price_type.clone().unwrap_or_else(|| "ondemand".to_string()),
        })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.status.as_str(), "terminated" | "shutting-down")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_maps_to_result() {
        assert_eq!(MachineResult::from_instance_state("running"), MachineResult::Succeed);
        assert_eq!(MachineResult::from_instance_state("pending"), MachineResult::Executing);
        assert_eq!(MachineResult::from_instance_state("terminated"), MachineResult::Fail);
        assert_eq!(MachineResult::from_instance_state("shutting-down"), MachineResult::Fail);
    }

    #[test]
    fn scheduler_payload_uses_protocol_keys() {
        let machine = Machine {
            machine_id: "m-1".into(),
            instance_id: "i-0abc".into(),
            request_id: "req-1".into(),
            template_id: Some("tmpl-1".into()),
            resource_id: "fleet-1".into(),
            status: "running".into(),
            result: MachineResult::Succeed,
            instance_type: Some("t3.micro".into()),
            availability_zone: Some("us-east-1a".into()),
            private_ip: Some("10.0.0.5".into()),
            public_ip: None,
            launch_time: Some(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
            price_type: Some("spot".into()),
            provider_name: Some("aws-us-east-1".into()),
            provider_type: Some("aws".into()),
            provider_api: Some("EC2Fleet".into()),
            tags: HashMap::new(),
        };

        let payload = machine.to_scheduler_payload();
        assert_eq!(payload["machineId"], "m-1");
        assert_eq!(payload["name"], "i-0abc");
        assert_eq!(payload["result"], "succeed");
        assert_eq!(payload["privateIpAddress"], "10.0.0.5");
        assert_eq!(payload["publicIpAddress"], "");
        assert_eq!(payload["launchtime"], 1_700_000_000_i64);
        assert_eq!(payload["instanceType"], "t3.micro");
        assert_eq!(payload["priceType"], "spot");
    }
}
