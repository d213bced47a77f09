use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{DeviceProperties, DeviceSnapshot, DeviceState};
use crate::app::station::logcat::LogcatSession;

/// Releases every device at once. Meant for tests and recovery only.
pub const RELEASE_ALL: &str = "__ALL__";

pub struct DeviceRecord {
    pub id: String,
    pub state: DeviceState,
    pub properties: Option<DeviceProperties>,
    pub in_use: bool,
    pub last_installed_package: Option<String>,
    pub running_pid: Option<u32>,
    pub logcat: Option<LogcatSession>,
}

impl DeviceRecord {
    pub fn new(id: &str, state: DeviceState, properties: Option<DeviceProperties>) -> Self {
        Self {
            id: id.to_string(),
            state,
            properties,
            in_use: false,
            last_installed_package: None,
            running_pid: None,
            logcat: None,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            state: self.state,
            in_use: self.in_use,
            properties: self.properties.clone().unwrap_or_default(),
        }
    }
}

/// One result line of an enumeration pass.
#[derive(Debug, Clone)]
pub struct EnumeratedDevice {
    pub id: String,
    pub state: DeviceState,
    pub properties: Option<DeviceProperties>,
}

/// In-memory set of attached devices and their lease state for one host.
///
/// The mutex is only held for bookkeeping, never across a device-tool call.
/// Iteration order is discovery order.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<IndexMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.lock().values().map(DeviceRecord::snapshot).collect()
    }

    /// Ids whose properties were already captured; those are not re-queried.
    pub fn ids_with_properties(&self) -> HashSet<String> {
        self.lock()
            .values()
            .filter(|record| record.properties.is_some())
            .map(|record| record.id.clone())
            .collect()
    }

    /// Applies one enumeration pass: new usable devices get fresh records,
    /// known ones only get their connection state (and missing properties)
    /// updated, and anything absent is dropped whatever its lease state.
    /// Returns the removed ids.
    pub fn apply_enumeration(&self, found: Vec<EnumeratedDevice>, trace_id: &str) -> Vec<String> {
        let usable: Vec<EnumeratedDevice> =
            found.into_iter().filter(|entry| entry.state.is_usable()).collect();
        let present: HashSet<&str> = usable.iter().map(|entry| entry.id.as_str()).collect();

        let removed_records = {
            let mut devices = self.lock();
            let gone: Vec<String> = devices
                .keys()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect();
            let removed: Vec<DeviceRecord> = gone
                .iter()
                .filter_map(|id| devices.shift_remove(id))
                .collect();

            for entry in &usable {
                match devices.get_mut(&entry.id) {
                    Some(record) => {
                        record.state = entry.state;
                        if record.properties.is_none() {
                            record.properties = entry.properties.clone();
                        }
                    }
                    None => {
                        info!(trace_id = %trace_id, device_id = %entry.id, "device discovered");
                        devices.insert(
                            entry.id.clone(),
                            DeviceRecord::new(&entry.id, entry.state, entry.properties.clone()),
                        );
                    }
                }
            }
            removed
        };

        let mut removed_ids = Vec::with_capacity(removed_records.len());
        for mut record in removed_records {
            if record.in_use {
                warn!(trace_id = %trace_id, device_id = %record.id, "leased device disappeared");
            } else {
                info!(trace_id = %trace_id, device_id = %record.id, "device removed");
            }
            if let Some(session) = record.logcat.take() {
                let path = session.force_stop();
                warn!(
                    trace_id = %trace_id,
                    device_id = %record.id,
                    path = %path.display(),
                    "stopped orphaned logcat capture of removed device"
                );
            }
            removed_ids.push(record.id);
        }
        removed_ids
    }

    /// Marks free devices as in use. With `desired_ids` every free listed
    /// device is taken (in discovery order); otherwise up to `count`.
    /// A short result is a success; an empty one is `ERR_UNAVAILABLE`.
    pub fn lease(
        &self,
        desired_ids: &[String],
        count: usize,
        trace_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let mut devices = self.lock();
        let mut leased = Vec::new();
        for record in devices.values_mut() {
            if record.in_use {
                continue;
            }
            if desired_ids.is_empty() {
                if leased.len() >= count {
                    break;
                }
            } else if !desired_ids.iter().any(|id| id == &record.id) {
                continue;
            }
            record.in_use = true;
            leased.push(record.id.clone());
        }
        if leased.is_empty() {
            return Err(AppError::unavailable("No free devices", trace_id));
        }
        Ok(leased)
    }

    pub fn release(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        let mut devices = self.lock();
        if device_id == RELEASE_ALL {
            for record in devices.values_mut() {
                record.in_use = false;
            }
            return Ok(());
        }
        match devices.get_mut(device_id) {
            Some(record) => {
                record.in_use = false;
                Ok(())
            }
            None => Err(AppError::not_found(
                format!("Device not found: {device_id}"),
                trace_id,
            )),
        }
    }

    /// Runs `f` on the record while holding the registry lock.
    pub fn with_device<T>(
        &self,
        device_id: &str,
        trace_id: &str,
        f: impl FnOnce(&mut DeviceRecord) -> T,
    ) -> Result<T, AppError> {
        let mut devices = self.lock();
        let record = devices.get_mut(device_id).ok_or_else(|| {
            AppError::not_found(format!("Device not found: {device_id}"), trace_id)
        })?;
        Ok(f(record))
    }

    pub fn leased_count(&self) -> usize {
        self.lock().values().filter(|record| record.in_use).count()
    }
}
