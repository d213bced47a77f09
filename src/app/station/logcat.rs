use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::app::adb::runner::{device_args, ToolRunner};
use crate::app::error::AppError;

/// One running `adb logcat` capture writing into a file.
///
/// The session owns the capture process until [`LogcatSession::stop`] or
/// [`LogcatSession::force_stop`] hands back the file path. Dropping a session
/// that is still running kills the process and logs a warning; callers are
/// expected to stop it explicitly.
#[derive(Debug)]
pub struct LogcatSession {
    device_id: String,
    child: Option<Child>,
    path: PathBuf,
    pid: u32,
}

impl LogcatSession {
    pub fn start(
        runner: &dyn ToolRunner,
        device_id: &str,
        capture_dir: &Path,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        fs::create_dir_all(capture_dir).map_err(|err| {
            AppError::internal(format!("Failed to create capture dir: {err}"), trace_id)
        })?;
        let prefix = format!(
            "logcat-{}-{}-",
            file_safe(device_id),
            Utc::now().format("%Y%m%dT%H%M%S")
        );
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".log")
            .tempfile_in(capture_dir)
            .map_err(|err| {
                AppError::internal(format!("Failed to create capture file: {err}"), trace_id)
            })?;
        let (file, path) = temp.keep().map_err(|err| {
            AppError::internal(format!("Failed to keep capture file: {err}"), trace_id)
        })?;

        let child = match runner.spawn_capture(&device_args(device_id, &["logcat"]), file, trace_id)
        {
            Ok(child) => child,
            Err(err) => {
                let _ = fs::remove_file(&path);
                return Err(err);
            }
        };
        let pid = child.id();
        info!(
            trace_id = %trace_id,
            device_id = %device_id,
            pid,
            path = %path.display(),
            "logcat capture started"
        );
        Ok(Self {
            device_id: device_id.to_string(),
            child: Some(child),
            path,
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Asks the capture to terminate, waits up to `grace`, then kills it.
    pub fn stop(mut self, grace: Duration, trace_id: &str) -> PathBuf {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(
                        trace_id = %trace_id,
                        device_id = %self.device_id,
                        exit_code = ?status.code(),
                        "logcat process not running at stop"
                    );
                }
                _ => {
                    request_terminate(&mut child);
                    if !wait_with_grace(&mut child, grace) {
                        warn!(
                            trace_id = %trace_id,
                            device_id = %self.device_id,
                            "logcat process did not terminate gracefully; killing"
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                    }
                }
            }
        }
        std::mem::take(&mut self.path)
    }

    /// Kills the capture immediately; used when a device disappears.
    pub fn force_stop(mut self) -> PathBuf {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        std::mem::take(&mut self.path)
    }
}

impl Drop for LogcatSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(
                device_id = %self.device_id,
                pid = self.pid,
                "logcat session dropped while running; killing capture"
            );
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    if kill(Pid::from_raw(raw), Signal::SIGTERM).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.kill();
}

fn wait_with_grace(child: &mut Child, grace: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) if start.elapsed() < grace => std::thread::sleep(Duration::from_millis(25)),
            Ok(None) | Err(_) => return false,
        }
    }
}

fn file_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
