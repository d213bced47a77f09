//! In-process stand-ins for adb and the package tooling, shared by the
//! station, rpc and orchestrator tests.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;

use crate::app::adb::apk::PackageTools;
use crate::app::adb::runner::{CommandOutput, ToolRunner};
use crate::app::error::AppError;

pub const FAKE_PID: u32 = 4242;
pub const BENIGN_INSTALL_STDERR: &str = "All files should be loaded. Notifying the device.";

#[derive(Debug, Default)]
pub struct FakeDevice {
    pub state: String,
    pub installed: BTreeSet<String>,
    pub running: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct FakeAdbState {
    pub devices: IndexMap<String, FakeDevice>,
    pub calls: Vec<Vec<String>>,
    pub marks: Vec<String>,
    pub devices_times_out: bool,
    pub fail_install: bool,
    pub fail_uninstall: bool,
    pub never_starts: bool,
    pub fail_clear: bool,
    pub fail_force_stop: bool,
    pub fail_capture: bool,
    /// `install` does its work, then reports a timeout.
    pub install_times_out: bool,
    pub call_delay: Duration,
    pub active_calls: usize,
    pub max_active_calls: usize,
}

#[derive(Clone, Default)]
pub struct FakeAdb {
    state: Arc<Mutex<FakeAdbState>>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

fn failed(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: Some(1),
    }
}

impl FakeAdb {
    pub fn with_devices(devices: &[(&str, &str)]) -> Self {
        let adb = Self::default();
        {
            let mut state = adb.state();
            for (id, device_state) in devices {
                state.devices.insert(
                    id.to_string(),
                    FakeDevice {
                        state: device_state.to_string(),
                        ..FakeDevice::default()
                    },
                );
            }
        }
        adb
    }

    pub fn state(&self) -> MutexGuard<'_, FakeAdbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn installed(&self, device_id: &str) -> Vec<String> {
        self.state()
            .devices
            .get(device_id)
            .map(|device| device.installed.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unplug(&self, device_id: &str) {
        self.state().devices.shift_remove(device_id);
    }

    pub fn count_calls(&self, needle: &[&str]) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| {
                call.windows(needle.len())
                    .any(|window| window.iter().zip(needle).all(|(a, b)| a == b))
            })
            .count()
    }

    fn respond(&self, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError> {
        let mut state = self.state();
        if args.first().map(String::as_str) == Some("devices") {
            if state.devices_times_out {
                return Err(AppError::tool_timeout("adb devices timed out", trace_id));
            }
            let mut out = String::from("List of devices attached\n");
            for (id, device) in &state.devices {
                out.push_str(&format!("{id}\t{}\n", device.state));
            }
            return Ok(ok(out));
        }

        let (Some("-s"), Some(id)) = (args.first().map(String::as_str), args.get(1)) else {
            return Ok(failed(format!("unsupported invocation: {}", args.join(" "))));
        };
        let rest: Vec<&str> = args[2..].iter().map(String::as_str).collect();
        let fail_install = state.fail_install;
        let fail_uninstall = state.fail_uninstall;
        let never_starts = state.never_starts;
        let fail_clear = state.fail_clear;
        let fail_force_stop = state.fail_force_stop;
        if let ["shell", "log", "-t", _tag, message @ ..] = rest.as_slice() {
            let message = message.join(" ");
            state.marks.push(message);
            return Ok(ok(""));
        }
        let Some(device) = state.devices.get_mut(id) else {
            return Ok(failed(format!("adb: device '{id}' not found")));
        };

        let output = match rest.as_slice() {
            ["shell", "getprop"] => ok(format!(
                "[ro.product.cpu.abi]: [arm64-v8a]\n[ro.product.model]: [Fake {id}]\n[ro.build.version.sdk]: [34]\n[ro.build.version.release]: [14]\n[ro.product.manufacturer]: [Fake]\n"
            )),
            ["install", path] => {
                if fail_install {
                    failed("Failure [INSTALL_FAILED_INVALID_APK]")
                } else {
                    let package = Path::new(path)
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().to_string())
                        .unwrap_or_default();
                    device.installed.insert(package);
                    CommandOutput {
                        stdout: "Performing Streamed Install\nSuccess\n".to_string(),
                        stderr: BENIGN_INSTALL_STDERR.to_string(),
                        exit_code: Some(0),
                    }
                }
            }
            ["uninstall", package] => {
                if fail_uninstall || !device.installed.remove(*package) {
                    failed("Failure [DELETE_FAILED_INTERNAL_ERROR]")
                } else {
                    device.running.remove(*package);
                    ok("Success\n")
                }
            }
            ["shell", "pm", "list", "packages"] => ok(device
                .installed
                .iter()
                .map(|package| format!("package:{package}\n"))
                .collect::<String>()),
            ["shell", "monkey", "-p", package, ..] => {
                if !never_starts && device.installed.contains(*package) {
                    device.running.insert(package.to_string());
                }
                ok("Events injected: 1\n")
            }
            ["shell", "am", "start", ..] => {
                if !never_starts {
                    let installed: Vec<String> = device.installed.iter().cloned().collect();
                    device.running.extend(installed);
                }
                ok("Starting: Intent\n")
            }
            ["shell", "pidof", package] => {
                if device.running.contains(*package) {
                    ok(format!("{FAKE_PID}\n"))
                } else {
                    failed("")
                }
            }
            ["shell", "pm", "clear", package] => {
                if fail_clear {
                    ok("Failed\n")
                } else {
                    device.running.remove(*package);
                    ok("Success\n")
                }
            }
            ["shell", "am", "force-stop", package] => {
                if fail_force_stop {
                    failed("Security exception: not allowed")
                } else {
                    device.running.remove(*package);
                    ok("")
                }
            }
            ["logcat", "-c"] => ok(""),
            _ => failed(format!("unsupported invocation: {}", args.join(" "))),
        };
        Ok(output)
    }
}

impl ToolRunner for FakeAdb {
    fn run(
        &self,
        args: &[String],
        _timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(args.to_vec());
            state.active_calls += 1;
            state.max_active_calls = state.max_active_calls.max(state.active_calls);
            state.call_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = self.respond(args, trace_id);
        let mut state = self.state();
        state.active_calls -= 1;
        if state.install_times_out && args.get(2).map(String::as_str) == Some("install") {
            return Err(AppError::tool_timeout("adb install timed out", trace_id));
        }
        result
    }

    fn spawn_capture(
        &self,
        args: &[String],
        sink: File,
        trace_id: &str,
    ) -> Result<Child, AppError> {
        {
            let mut state = self.state();
            state.calls.push(args.to_vec());
            if state.fail_capture {
                return Err(AppError::tool("Failed to start capture: injected", trace_id));
            }
        }
        Command::new("sh")
            .arg("-c")
            .arg("echo '--------- beginning of main'; echo 'I/ActivityManager: fake capture'; exec sleep 30")
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AppError::tool(format!("Failed to start capture: {err}"), trace_id))
    }
}

/// Package name is the file stem; signing is a no-op.
#[derive(Clone, Default)]
pub struct FakePackageTools {
    signed: Arc<Mutex<Vec<PathBuf>>>,
    convert_delay: Duration,
}

impl FakePackageTools {
    pub fn with_convert_delay(delay: Duration) -> Self {
        Self {
            convert_delay: delay,
            ..Self::default()
        }
    }

    pub fn signed(&self) -> Vec<PathBuf> {
        self.signed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PackageTools for FakePackageTools {
    fn package_name(&self, apk: &Path, trace_id: &str) -> Result<String, AppError> {
        apk.file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .ok_or_else(|| AppError::tool("Could not get package name", trace_id))
    }

    fn sign(&self, apk: &Path, _trace_id: &str) -> Result<PathBuf, AppError> {
        self.signed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(apk.to_path_buf());
        Ok(apk.to_path_buf())
    }

    fn convert_bundle(&self, bundle: &Path, trace_id: &str) -> Result<PathBuf, AppError> {
        if !self.convert_delay.is_zero() {
            std::thread::sleep(self.convert_delay);
        }
        let stem = bundle
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = bundle.with_file_name(stem);
        let target = dir.join("universal.apk");
        fs::create_dir_all(&dir)
            .and_then(|_| fs::copy(bundle, &target))
            .map_err(|err| AppError::tool(format!("conversion failed: {err}"), trace_id))?;
        Ok(target)
    }
}
