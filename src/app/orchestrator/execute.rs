use std::collections::BTreeMap;
use std::path::Path;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app::adb::apk::PackageFormat;
use crate::app::error::AppError;
use crate::app::models::{ExecuteRequest, ExecutionOutcome};
use crate::app::orchestrator::pipeline::{run_device, DeviceJob};
use crate::app::orchestrator::router::{DeviceKey, HostRouter};

pub const UPLOAD_FAILED_MESSAGE: &str = "File Upload to backend failed!";

/// Checks the request before anything is leased and returns the parsed keys.
pub fn validate_request(
    package: &Path,
    request: &ExecuteRequest,
    trace_id: &str,
) -> Result<Vec<DeviceKey>, AppError> {
    if request.execution_secs == 0 {
        return Err(AppError::validation(
            "Execution time must be greater than 0",
            trace_id,
        ));
    }
    if PackageFormat::from_path(package).is_none() {
        return Err(AppError::validation(
            "Only .apk/.aab files supported!",
            trace_id,
        ));
    }
    if !package.is_file() {
        return Err(AppError::not_found(
            format!("File not found: {}", package.display()),
            trace_id,
        ));
    }
    if request.device_keys.is_empty() {
        return Err(AppError::validation(
            "Devices list cannot be empty",
            trace_id,
        ));
    }
    request
        .device_keys
        .iter()
        .map(|raw| DeviceKey::parse(raw, trace_id))
        .collect()
}

/// Runs `package` on every requested device and returns one outcome per
/// device key. The call only fails as a whole when the request is invalid or
/// nothing could be leased; everything after that is reported per device.
pub async fn execute_package(
    router: &HostRouter,
    package: &Path,
    request: &ExecuteRequest,
    trace_id: &str,
) -> Result<BTreeMap<String, ExecutionOutcome>, AppError> {
    let keys = validate_request(package, request, trace_id)?;
    let mut outcomes = BTreeMap::new();
    for key in &keys {
        if router.client(&key.host).is_none() {
            outcomes.insert(
                key.key(),
                ExecutionOutcome::failed(
                    &key.device_id,
                    &key.host,
                    format!("Host not found: {}", key.host),
                ),
            );
        }
    }

    let leased = router.lease_keys(&keys, trace_id).await?;
    let filename = package
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut tasks = JoinSet::new();
    for (host, device_ids) in leased {
        let Some(client) = router.client(&host).cloned() else {
            continue;
        };
        info!(trace_id = %trace_id, host = %host, package = %package.display(), "uploading package");
        let package_path = match client.upload_package(package, &filename, trace_id).await {
            Ok(path) => path,
            Err(err) => {
                error!(trace_id = %trace_id, host = %host, code = %err.code, "Failed to upload app: {}", err.error);
                for device_id in &device_ids {
                    if let Err(err) = client.release(device_id, trace_id).await {
                        warn!(trace_id = %trace_id, host = %host, device_id = %device_id, "Unlocking device failed: {}", err.error);
                    }
                    outcomes.insert(
                        DeviceKey::new(device_id, &host).key(),
                        ExecutionOutcome::failed(device_id, &host, UPLOAD_FAILED_MESSAGE),
                    );
                }
                continue;
            }
        };
        info!(trace_id = %trace_id, host = %host, path = %package_path, "package stored");

        for device_id in device_ids {
            let job = DeviceJob {
                client: client.clone(),
                device_id,
                package_path: package_path.clone(),
                execution_secs: request.execution_secs,
                sign: request.sign,
                custom_command: request.custom_command.clone(),
            };
            tasks.spawn(run_device(job, trace_id.to_string()));
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                let key = DeviceKey::new(&outcome.device_id, &outcome.host).key();
                outcomes.insert(key, outcome);
            }
            // run_device catches pipeline panics itself; this only fires if
            // the cleanup path panics.
            Err(err) => error!(trace_id = %trace_id, "device task failed: {err}"),
        }
    }
    Ok(outcomes)
}
