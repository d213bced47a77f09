use std::collections::BTreeMap;

use indexmap::IndexMap;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::app::config::StationConfig;
use crate::app::error::AppError;
use crate::app::models::{DeviceFilter, DeviceSnapshot, HostDevice, HostInfo};
use crate::app::rpc::client::StationClient;

/// `<device-id>_<host>`: the caller-visible name of a device in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey {
    pub device_id: String,
    pub host: String,
}

impl DeviceKey {
    pub fn new(device_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            host: host.into(),
        }
    }

    pub fn parse(raw: &str, trace_id: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        let mut parts = trimmed.split('_');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device_id), Some(host), None)
                if !device_id.trim().is_empty() && !host.trim().is_empty() =>
            {
                Ok(Self::new(device_id.trim(), host.trim()))
            }
            _ => Err(AppError::validation(
                format!("Invalid device format: {trimmed}"),
                trace_id,
            )),
        }
    }

    pub fn key(&self) -> String {
        format!("{}_{}", self.device_id, self.host)
    }
}

/// Fans calls out to every configured host. A failing host is logged and
/// left out of the merged result; it never fails the whole call.
#[derive(Debug, Clone, Default)]
pub struct HostRouter {
    clients: BTreeMap<String, StationClient>,
}

impl HostRouter {
    pub fn new(clients: impl IntoIterator<Item = StationClient>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|client| (client.name().to_string(), client))
                .collect(),
        }
    }

    pub fn from_config(config: &StationConfig) -> Self {
        Self::new(
            config
                .hosts
                .iter()
                .map(|(name, addr)| StationClient::new(name, addr, config.client.clone())),
        )
    }

    pub fn client(&self, host: &str) -> Option<&StationClient> {
        self.clients.get(host)
    }

    pub fn host_names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Liveness probe of every host.
    pub async fn probe(&self, trace_id: &str) -> BTreeMap<String, Result<HostInfo, AppError>> {
        let mut tasks = JoinSet::new();
        for client in self.clients.values().cloned() {
            let trace = trace_id.to_string();
            tasks.spawn(async move {
                let result = client.host_info(&trace).await;
                (client.name().to_string(), result)
            });
        }
        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, result)) => {
                    results.insert(host, result);
                }
                Err(err) => warn!(trace_id = %trace_id, "host probe task failed: {err}"),
            }
        }
        results
    }

    async fn devices_per_host(&self, trace_id: &str) -> BTreeMap<String, Vec<DeviceSnapshot>> {
        let mut tasks = JoinSet::new();
        for client in self.clients.values().cloned() {
            let trace = trace_id.to_string();
            tasks.spawn(async move {
                let result = client.list_devices(&trace).await;
                (client.name().to_string(), result)
            });
        }
        let mut per_host = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, Ok(devices))) => {
                    per_host.insert(host, devices);
                }
                Ok((host, Err(err))) => {
                    warn!(trace_id = %trace_id, host = %host, code = %err.code, "failed to get devices: {}", err.error)
                }
                Err(err) => warn!(trace_id = %trace_id, "device listing task failed: {err}"),
            }
        }
        per_host
    }

    /// Lists devices of all reachable hosts, keyed by [`DeviceKey::key`].
    ///
    /// With `device_keys` only those devices are returned and `max_count` is
    /// ignored. Otherwise devices whose cpu ABI matches `architecture` (when
    /// set) are collected up to `max_count` (0 means no limit).
    pub async fn list_devices(
        &self,
        filter: &DeviceFilter,
        trace_id: &str,
    ) -> IndexMap<String, HostDevice> {
        let per_host = self.devices_per_host(trace_id).await;
        let mut devices = IndexMap::new();
        for (host, snapshots) in per_host {
            for snapshot in snapshots {
                let key = DeviceKey::new(&snapshot.id, &host).key();
                if !filter.device_keys.is_empty() {
                    if filter.device_keys.contains(&key) {
                        devices.insert(key, HostDevice { host: host.clone(), device: snapshot });
                    }
                    continue;
                }
                if filter.max_count > 0 && devices.len() >= filter.max_count {
                    return devices;
                }
                let arch_matches = match filter.architecture.as_deref() {
                    Some(arch) => snapshot.properties.cpu_abi.as_deref() == Some(arch),
                    None => true,
                };
                if arch_matches {
                    devices.insert(key, HostDevice { host: host.clone(), device: snapshot });
                }
            }
        }
        devices
    }

    /// Leases the given devices on their hosts. Keys naming an unknown host
    /// are skipped; a host that fails contributes nothing. Returns leased ids
    /// per host, or `ERR_UNAVAILABLE` when nothing could be leased.
    pub async fn lease_keys(
        &self,
        keys: &[DeviceKey],
        trace_id: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, AppError> {
        let mut wanted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in keys {
            if !self.clients.contains_key(&key.host) {
                warn!(trace_id = %trace_id, host = %key.host, "unknown host in device key");
                continue;
            }
            let ids = wanted.entry(key.host.clone()).or_default();
            if !ids.contains(&key.device_id) {
                ids.push(key.device_id.clone());
            }
        }

        let mut tasks = JoinSet::new();
        for (host, ids) in wanted {
            let Some(client) = self.clients.get(&host).cloned() else {
                continue;
            };
            let trace = trace_id.to_string();
            tasks.spawn(async move {
                let result = client.lease(ids.len(), ids, &trace).await;
                (host, result)
            });
        }

        let mut leased = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((host, Ok(ids))) if !ids.is_empty() => {
                    info!(trace_id = %trace_id, host = %host, devices = ?ids, "leased");
                    leased.insert(host, ids);
                }
                Ok((host, Ok(_))) => {
                    warn!(trace_id = %trace_id, host = %host, "host leased no devices")
                }
                Ok((host, Err(err))) => {
                    warn!(trace_id = %trace_id, host = %host, code = %err.code, "failed to get free devices: {}", err.error)
                }
                Err(err) => warn!(trace_id = %trace_id, "lease task failed: {err}"),
            }
        }
        if leased.is_empty() {
            return Err(AppError::unavailable("Could not lock any device", trace_id));
        }
        Ok(leased)
    }
}
