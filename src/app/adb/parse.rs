use std::collections::HashMap;

use crate::app::models::{DeviceProperties, DeviceState};

pub const PROP_CPU_ABI: &str = "ro.product.cpu.abi";
pub const PROP_MODEL: &str = "ro.product.model";
pub const PROP_SDK: &str = "ro.build.version.sdk";
pub const PROP_RELEASE: &str = "ro.build.version.release";
pub const PROP_MANUFACTURER: &str = "ro.product.manufacturer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: String,
    pub state: DeviceState,
}

/// Parses `adb devices` output. Only `<id>\t<state>` lines with a known state
/// are kept; headers, daemon banners and anything else are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('\t');
            let id = fields.next()?.trim();
            let state = fields.next()?;
            if id.is_empty() || fields.next().is_some() {
                return None;
            }
            let state = DeviceState::parse(state)?;
            Some(DeviceEntry {
                id: id.to_string(),
                state,
            })
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

pub fn build_device_properties(
    getprop_map: &HashMap<String, String>,
    extra_keys: &[String],
) -> DeviceProperties {
    let extra = extra_keys
        .iter()
        .filter_map(|key| getprop_map.get(key).map(|value| (key.clone(), value.clone())))
        .collect();
    DeviceProperties {
        cpu_abi: getprop_map.get(PROP_CPU_ABI).cloned(),
        model: getprop_map.get(PROP_MODEL).cloned(),
        sdk: getprop_map.get(PROP_SDK).cloned(),
        release: getprop_map.get(PROP_RELEASE).cloned(),
        manufacturer: getprop_map.get(PROP_MANUFACTURER).cloned(),
        extra,
    }
}

/// First numeric token of `pidof` output.
pub fn parse_pidof(output: &str) -> Option<u32> {
    output
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u32>().ok())
}

/// Case-insensitive substring match over `pm list packages` output.
pub fn package_listed(pm_output: &str, package_name: &str) -> bool {
    let needle = package_name.trim().to_lowercase();
    if needle.is_empty() {
        return false;
    }
    pm_output
        .lines()
        .any(|line| line.to_lowercase().contains(&needle))
}

/// `pm clear` prints exactly `Success` when it worked.
pub fn pm_clear_succeeded(stdout: &str, stderr: &str) -> bool {
    stdout.trim() == "Success" && stderr.trim().is_empty()
}
