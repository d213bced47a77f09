//! Per-device execution: logcat, install, run, kill, uninstall, then
//! log retrieval and lease release on every exit path.

use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::ExecutionOutcome;
use crate::app::rpc::client::StationClient;

/// Everything one device needs for a run. The device is already leased.
#[derive(Debug, Clone)]
pub struct DeviceJob {
    pub client: StationClient,
    pub device_id: String,
    /// Package path on the host, relative to its storage root.
    pub package_path: String,
    pub execution_secs: u64,
    pub sign: bool,
    pub custom_command: Option<String>,
}

/// Runs the pipeline for one leased device and always hands the device back.
///
/// The pipeline itself runs in its own task so that a panic inside it still
/// ends in [`release_device`].
pub async fn run_device(job: DeviceJob, trace_id: String) -> ExecutionOutcome {
    let client = job.client.clone();
    let device_id = job.device_id.clone();
    let trace = trace_id.clone();
    let outcome = match tokio::spawn(run_pipeline(job, trace)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(trace_id = %trace_id, device_id = %device_id, host = %client.name(), "pipeline task failed: {err}");
            ExecutionOutcome::failed(&device_id, client.name(), format!("Internal error: {err}"))
        }
    };
    release_device(&client, &device_id, &trace_id).await;
    outcome
}

async fn run_pipeline(job: DeviceJob, trace_id: String) -> ExecutionOutcome {
    let stages = run_stages(&job, &trace_id).await;
    let collected = collect_log(&job, &trace_id).await;

    let (error, message) = match (&stages, &collected) {
        (Err(message), _) => (true, message.clone()),
        (Ok(()), Err(message)) => (true, message.clone()),
        (Ok(()), Ok(_)) => (false, String::new()),
    };
    if let (Err(first), Err(second)) = (&stages, &collected) {
        warn!(trace_id = %trace_id, device_id = %job.device_id, "{first}; also {second}");
    }
    info!(trace_id = %trace_id, device_id = %job.device_id, host = %job.client.name(), error, "device run finished");

    ExecutionOutcome {
        device_id: job.device_id,
        host: job.client.name().to_string(),
        error,
        message,
        log: collected.ok(),
    }
}

/// The strictly sequential part. Stops at the first failing stage.
async fn run_stages(job: &DeviceJob, trace_id: &str) -> Result<(), String> {
    let client = &job.client;
    let device_id = job.device_id.as_str();

    client
        .start_logcat(device_id, trace_id)
        .await
        .map_err(|err| stage_error("start_logcat_collect", &err))?;
    client
        .install(device_id, &job.package_path, job.sign, trace_id)
        .await
        .map_err(|err| stage_error("install_app", &err))?;
    client
        .run(device_id, job.execution_secs, job.custom_command.as_deref(), trace_id)
        .await
        .map_err(|err| err.error)?;
    client
        .kill(device_id, trace_id)
        .await
        .map_err(|err| stage_error("kill_app", &err))?;
    client
        .uninstall(device_id, None, trace_id)
        .await
        .map_err(|err| stage_error("uninstall_app", &err))?;
    Ok(())
}

fn stage_error(stage: &str, err: &AppError) -> String {
    format!("Error {stage}: {}", err.error)
}

/// Stops the capture and pulls its content back. Runs whatever the stages
/// did.
async fn collect_log(job: &DeviceJob, trace_id: &str) -> Result<String, String> {
    let path = job
        .client
        .stop_logcat(&job.device_id, trace_id)
        .await
        .map_err(|err| format!("Error stopping logcat: {}", err.error))?;
    let bytes = job
        .client
        .pull_file(&path, trace_id)
        .await
        .map_err(|err| format!("Error pulling logcat: {}", err.error))?;
    String::from_utf8(bytes).map_err(|err| format!("Error decoding logcat: {err}"))
}

/// Outer cleanup: uninstall leftovers, stop a leftover capture, release the
/// lease. Each step runs even when the previous one failed; nothing here is
/// returned to the caller.
pub async fn release_device(client: &StationClient, device_id: &str, trace_id: &str) {
    match client.uninstall(device_id, None, trace_id).await {
        Ok(package) => {
            info!(trace_id = %trace_id, device_id = %device_id, package = %package, "cleanup uninstalled leftover package")
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            warn!(trace_id = %trace_id, device_id = %device_id, code = %err.code, "Uninstalling app failed: {}", err.error)
        }
    }
    match client.stop_logcat(device_id, trace_id).await {
        Ok(path) => {
            info!(trace_id = %trace_id, device_id = %device_id, path = %path, "cleanup stopped leftover logcat")
        }
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            warn!(trace_id = %trace_id, device_id = %device_id, code = %err.code, "Stopping logcat collection failed: {}", err.error)
        }
    }
    if let Err(err) = client.release(device_id, trace_id).await {
        warn!(trace_id = %trace_id, device_id = %device_id, code = %err.code, "Unlocking device failed: {}", err.error);
    }
}
