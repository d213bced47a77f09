use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "STATION_CONFIG_PATH";
pub const HOST_ENV_PREFIX: &str = "STATION_HOST_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub listen_addr: String,
    pub storage_root: String,
    pub upload_dir: String,
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            storage_root: "./station-data".to_string(),
            upload_dir: "UploadedFiles".to_string(),
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbSettings {
    pub command_path: String,
    pub command_timeout_secs: u64,
    pub devices_timeout_secs: u64,
    pub startup_grace_ms: u64,
    pub max_parallel_invocations: usize,
    pub extra_properties: Vec<String>,
    pub mark_tag: String,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            command_path: "adb".to_string(),
            command_timeout_secs: 10,
            devices_timeout_secs: 3,
            startup_grace_ms: 2000,
            max_parallel_invocations: 1,
            extra_properties: Vec::new(),
            mark_tag: "STATION_MARK".to_string(),
        }
    }
}

impl AdbSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn devices_timeout(&self) -> Duration {
        Duration::from_secs(self.devices_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogcatSettings {
    pub capture_dir: String,
    pub stop_grace_ms: u64,
    pub settle_ms: u64,
}

impl Default for LogcatSettings {
    fn default() -> Self {
        Self {
            capture_dir: String::new(),
            stop_grace_ms: 5000,
            settle_ms: 1000,
        }
    }
}

impl LogcatSettings {
    pub fn capture_dir(&self) -> PathBuf {
        if self.capture_dir.trim().is_empty() {
            std::env::temp_dir().join("adb_teststation_logcat")
        } else {
            PathBuf::from(&self.capture_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApkToolSettings {
    pub aapt2_path: String,
    pub apksigner_path: String,
    pub zipalign_path: String,
    pub bundletool_path: String,
    pub java_path: String,
    pub keystore_path: String,
    pub keystore_pass: String,
    pub key_alias: String,
    pub tool_timeout_secs: u64,
}

impl Default for ApkToolSettings {
    fn default() -> Self {
        Self {
            aapt2_path: "aapt2".to_string(),
            apksigner_path: "apksigner".to_string(),
            zipalign_path: "zipalign".to_string(),
            bundletool_path: "bundletool.jar".to_string(),
            java_path: "java".to_string(),
            keystore_path: String::new(),
            keystore_pass: String::new(),
            key_alias: String::new(),
            tool_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Extra wait for a package upload answer, which includes the host's
    /// bundle conversion. Matches the default `apk_tools.tool_timeout_secs`.
    pub package_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            request_timeout_secs: 60,
            package_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StationConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub adb: AdbSettings,
    #[serde(default)]
    pub logcat: LogcatSettings,
    #[serde(default)]
    pub apk_tools: ApkToolSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
}

pub fn config_path() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

/// Loads the file named by `STATION_CONFIG_PATH` (or defaults) and applies the
/// process environment on top.
pub fn load_config(trace_id: &str) -> Result<StationConfig, AppError> {
    load_config_at(config_path().as_deref(), trace_id)
}

/// Same as [`load_config`] but with an explicit file, e.g. from `--config`.
pub fn load_config_at(path: Option<&Path>, trace_id: &str) -> Result<StationConfig, AppError> {
    let config = match path {
        Some(path) => load_config_from_path(path, trace_id)?,
        None => StationConfig::default(),
    };
    let config = apply_env_overrides(config, std::env::vars());
    Ok(validate_config(config))
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<StationConfig, AppError> {
    if !path.exists() {
        return Ok(StationConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::internal(format!("Failed to read config: {err}"), trace_id))?;
    let config: StationConfig = serde_json::from_str(&raw).map_err(|err| {
        AppError::validation(format!("Failed to parse config: {err}"), trace_id)
    })?;
    Ok(validate_config(config))
}

pub fn apply_env_overrides(
    mut config: StationConfig,
    vars: impl IntoIterator<Item = (String, String)>,
) -> StationConfig {
    for (key, value) in vars {
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        match key.as_str() {
            "STATION_STORAGE_ROOT" => config.server.storage_root = value,
            "STATION_LISTEN_ADDR" => config.server.listen_addr = value,
            "STATION_ADB_PATH" => config.adb.command_path = value,
            "STATION_LOG_LEVEL" => config.server.log_level = value,
            _ => {
                if let Some(name) = key.strip_prefix(HOST_ENV_PREFIX) {
                    if !name.is_empty() {
                        config.hosts.insert(name.to_string(), value);
                    }
                }
            }
        }
    }
    config
}

fn validate_config(mut config: StationConfig) -> StationConfig {
    let defaults = StationConfig::default();
    if config.adb.command_timeout_secs == 0 {
        config.adb.command_timeout_secs = defaults.adb.command_timeout_secs;
    }
    if config.adb.devices_timeout_secs == 0 {
        config.adb.devices_timeout_secs = defaults.adb.devices_timeout_secs;
    }
    if config.adb.max_parallel_invocations == 0 {
        config.adb.max_parallel_invocations = 1;
    }
    if config.adb.mark_tag.trim().is_empty() {
        config.adb.mark_tag = defaults.adb.mark_tag;
    }
    if config.apk_tools.tool_timeout_secs == 0 {
        config.apk_tools.tool_timeout_secs = defaults.apk_tools.tool_timeout_secs;
    }
    if config.client.connect_timeout_secs == 0 {
        config.client.connect_timeout_secs = defaults.client.connect_timeout_secs;
    }
    if config.client.request_timeout_secs == 0 {
        config.client.request_timeout_secs = defaults.client.request_timeout_secs;
    }
    if config.client.package_timeout_secs == 0 {
        config.client.package_timeout_secs = defaults.client.package_timeout_secs;
    }
    if config.server.upload_dir.trim().is_empty() {
        config.server.upload_dir = defaults.server.upload_dir;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_add_hosts_and_paths() {
        let vars = vec![
            ("STATION_HOST_LAB1".to_string(), "10.0.0.5:8080".to_string()),
            ("STATION_HOST_LAB2".to_string(), " 10.0.0.6:9090 ".to_string()),
            ("STATION_STORAGE_ROOT".to_string(), "/srv/station".to_string()),
            ("STATION_HOST_".to_string(), "ignored:1".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let config = apply_env_overrides(StationConfig::default(), vars);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts.get("LAB2").map(String::as_str), Some("10.0.0.6:9090"));
        assert_eq!(config.server.storage_root, "/srv/station");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = StationConfig::default();
        config.adb.command_timeout_secs = 0;
        config.adb.max_parallel_invocations = 0;
        config.client.request_timeout_secs = 0;
        let validated = validate_config(config);
        assert_eq!(validated.adb.command_timeout_secs, 10);
        assert_eq!(validated.adb.max_parallel_invocations, 1);
        assert_eq!(validated.client.request_timeout_secs, 60);
    }

    #[test]
    fn loads_partial_file_with_defaults() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let path = tmp.path().join("station.json");
        fs::write(&path, r#"{"adb": {"command_path": "/opt/adb", "command_timeout_secs": 0}}"#)
            .expect("write");
        let config = load_config_from_path(&path, "trace").expect("load");
        assert_eq!(config.adb.command_path, "/opt/adb");
        assert_eq!(config.adb.command_timeout_secs, 10);
        assert_eq!(config.logcat.stop_grace_ms, 5000);
    }

    #[test]
    fn partial_sections_keep_other_field_defaults() {
        let raw = r#"{
            "server": {"listen_addr": "127.0.0.1:9000"},
            "logcat": {"settle_ms": 0},
            "apk_tools": {"aapt2_path": "/opt/aapt2"},
            "client": {"request_timeout_secs": 30},
            "hosts": {"LAB1": "10.0.0.5:8080"}
        }"#;
        let config: StationConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.server.upload_dir, "UploadedFiles");
        assert_eq!(config.logcat.settle_ms, 0);
        assert_eq!(config.logcat.stop_grace_ms, 5000);
        assert_eq!(config.apk_tools.aapt2_path, "/opt/aapt2");
        assert_eq!(config.apk_tools.tool_timeout_secs, 120);
        assert_eq!(config.client.request_timeout_secs, 30);
        assert_eq!(config.client.connect_timeout_secs, 5);
        assert_eq!(config.adb, AdbSettings::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config_from_path(Path::new("/no/such/station.json"), "trace")
            .expect("defaults");
        assert_eq!(config, StationConfig::default());
    }
}
