use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Connection state as reported by `adb devices`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Online,
    Unauthorized,
    Offline,
}

impl DeviceState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "device" => Some(DeviceState::Online),
            "unauthorized" => Some(DeviceState::Unauthorized),
            "offline" => Some(DeviceState::Offline),
            _ => None,
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, DeviceState::Online | DeviceState::Unauthorized)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProperties {
    pub cpu_abi: Option<String>,
    pub model: Option<String>,
    pub sdk: Option<String>,
    pub release: Option<String>,
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Caller-visible view of one registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub id: String,
    pub state: DeviceState,
    pub in_use: bool,
    pub properties: DeviceProperties,
}

/// A device as seen by the orchestrator: snapshot plus the host it lives on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDevice {
    pub host: String,
    #[serde(flatten)]
    pub device: DeviceSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    pub os: String,
    pub started_at: String,
    pub device_count: usize,
}

/// Per-device result of one orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub device_id: String,
    pub host: String,
    pub error: bool,
    pub message: String,
    pub log: Option<String>,
}

impl ExecutionOutcome {
    pub fn failed(device_id: &str, host: &str, message: impl Into<String>) -> Self {
        Self {
            device_id: device_id.to_string(),
            host: host.to_string(),
            error: true,
            message: message.into(),
            log: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceFilter {
    pub architecture: Option<String>,
    pub device_keys: BTreeSet<String>,
    pub max_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub execution_secs: u64,
    pub device_keys: Vec<String>,
    pub sign: bool,
    pub custom_command: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_usable_states() {
        assert_eq!(DeviceState::parse("device"), Some(DeviceState::Online));
        assert!(DeviceState::parse("unauthorized").is_some_and(DeviceState::is_usable));
        assert!(!DeviceState::Offline.is_usable());
        assert_eq!(DeviceState::parse("recovery"), None);
    }

    #[test]
    fn host_device_flattens_snapshot() {
        let device = HostDevice {
            host: "A".to_string(),
            device: DeviceSnapshot {
                id: "X".to_string(),
                state: DeviceState::Online,
                in_use: false,
                properties: DeviceProperties::default(),
            },
        };
        let value = serde_json::to_value(&device).expect("json");
        assert_eq!(value["host"], "A");
        assert_eq!(value["id"], "X");
        assert_eq!(value["state"], "online");
    }
}
