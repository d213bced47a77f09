use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::apk::{PackageFormat, PackageTools};
use crate::app::adb::parse::{
    build_device_properties, package_listed, parse_adb_devices, parse_getprop_map, parse_pidof,
    pm_clear_succeeded,
};
use crate::app::adb::runner::{device_args, CommandOutput, ToolRunner};
use crate::app::config::{AdbSettings, LogcatSettings};
use crate::app::error::{AppError, ERR_TOOL_TIMEOUT};
use crate::app::models::{DeviceProperties, DeviceSnapshot, DeviceState};
use crate::app::scheduler::ToolGate;
use crate::app::station::logcat::LogcatSession;
use crate::app::station::registry::{DeviceRegistry, EnumeratedDevice};

const LAUNCHER_CATEGORY: &str = "android.intent.category.LAUNCHER";

/// Runs device-tool operations for one host.
///
/// Every adb invocation goes through the host-wide [`ToolGate`], so two
/// devices on the same host never run tool commands at the same time. The
/// registry lock is only taken between invocations.
pub struct HostExecutor {
    registry: Arc<DeviceRegistry>,
    runner: Arc<dyn ToolRunner>,
    tools: Arc<dyn PackageTools>,
    gate: Arc<ToolGate>,
    adb: AdbSettings,
    logcat: LogcatSettings,
}

impl HostExecutor {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        runner: Arc<dyn ToolRunner>,
        tools: Arc<dyn PackageTools>,
        adb: AdbSettings,
        logcat: LogcatSettings,
    ) -> Self {
        let gate = ToolGate::new(adb.max_parallel_invocations);
        Self {
            registry,
            runner,
            tools,
            gate,
            adb,
            logcat,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn tools(&self) -> &dyn PackageTools {
        self.tools.as_ref()
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.logcat.capture_dir()
    }

    fn invoke_with_timeout(
        &self,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<CommandOutput, AppError> {
        let _permit = self.gate.acquire();
        debug!(trace_id = %trace_id, args = %args.join(" "), "adb invocation");
        self.runner.run(args, timeout, trace_id)
    }

    fn invoke(&self, args: &[String], trace_id: &str) -> Result<CommandOutput, AppError> {
        self.invoke_with_timeout(args, self.adb.command_timeout(), trace_id)
    }

    fn ensure_device(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        self.registry.with_device(device_id, trace_id, |_| ())
    }

    fn tracked_package(&self, device_id: &str, trace_id: &str) -> Result<Option<String>, AppError> {
        self.registry.with_device(device_id, trace_id, |record| {
            record.last_installed_package.clone()
        })
    }

    /// Writes a tagged marker line into the device log. Best effort.
    fn mark(&self, device_id: &str, message: &str, trace_id: &str) {
        let args = device_args(device_id, &["shell", "log", "-t", self.adb.mark_tag.as_str(), message]);
        match self.invoke(&args, trace_id) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                debug!(trace_id = %trace_id, device_id = %device_id, "log marker failed: {}", output.diagnostic())
            }
            Err(err) => debug!(trace_id = %trace_id, device_id = %device_id, "log marker failed: {err}"),
        }
    }

    /// Re-enumerates attached devices. An enumeration timeout counts as
    /// "no devices", so every known device is dropped in that case.
    pub fn refresh(&self, trace_id: &str) -> Result<(), AppError> {
        let entries = match self.invoke_with_timeout(
            &["devices".to_string()],
            self.adb.devices_timeout(),
            trace_id,
        ) {
            Ok(output) => parse_adb_devices(&output.stdout),
            Err(err) if err.code == ERR_TOOL_TIMEOUT => {
                warn!(trace_id = %trace_id, "device enumeration timed out; treating as empty");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let known = self.registry.ids_with_properties();
        let found = entries
            .into_iter()
            .map(|entry| {
                let properties = if entry.state == DeviceState::Online && !known.contains(&entry.id) {
                    self.read_properties(&entry.id, trace_id)
                } else {
                    None
                };
                EnumeratedDevice {
                    id: entry.id,
                    state: entry.state,
                    properties,
                }
            })
            .collect();
        self.registry.apply_enumeration(found, trace_id);
        Ok(())
    }

    fn read_properties(&self, device_id: &str, trace_id: &str) -> Option<DeviceProperties> {
        match self.invoke(&device_args(device_id, &["shell", "getprop"]), trace_id) {
            Ok(output) if output.success() => Some(build_device_properties(
                &parse_getprop_map(&output.stdout),
                &self.adb.extra_properties,
            )),
            Ok(output) => {
                warn!(trace_id = %trace_id, device_id = %device_id, "getprop failed: {}", output.diagnostic());
                None
            }
            Err(err) => {
                warn!(trace_id = %trace_id, device_id = %device_id, "getprop failed: {err}");
                None
            }
        }
    }

    pub fn list_devices(&self, trace_id: &str) -> Result<Vec<DeviceSnapshot>, AppError> {
        self.refresh(trace_id)?;
        Ok(self.registry.snapshot())
    }

    pub fn lease(
        &self,
        desired_ids: &[String],
        count: usize,
        trace_id: &str,
    ) -> Result<Vec<String>, AppError> {
        if self.registry.is_empty() {
            self.refresh(trace_id)?;
        }
        let leased = self.registry.lease(desired_ids, count, trace_id)?;
        info!(trace_id = %trace_id, devices = ?leased, "devices leased");
        Ok(leased)
    }

    pub fn release(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        self.registry.release(device_id, trace_id)?;
        info!(trace_id = %trace_id, device_id = %device_id, "device released");
        Ok(())
    }

    pub fn is_package_installed(
        &self,
        device_id: &str,
        package: &str,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        self.ensure_device(device_id, trace_id)?;
        let output = self.invoke(
            &device_args(device_id, &["shell", "pm", "list", "packages"]),
            trace_id,
        )?;
        if !output.success() {
            return Err(AppError::tool(
                format!("Could not list packages: {}", output.diagnostic()),
                trace_id,
            ));
        }
        Ok(package_listed(&output.stdout, package))
    }

    /// Installs `apk` and returns the package name. Success is decided by
    /// looking the package up afterwards; adb's own stderr is not trusted.
    pub fn install(
        &self,
        device_id: &str,
        apk: &Path,
        sign: bool,
        trace_id: &str,
    ) -> Result<String, AppError> {
        self.ensure_device(device_id, trace_id)?;
        if !apk.is_file() {
            return Err(AppError::not_found("Appfile not found!", trace_id));
        }
        if PackageFormat::from_path(apk) != Some(PackageFormat::Apk) {
            return Err(AppError::validation(
                format!("Only .apk files can be installed: {}", apk.display()),
                trace_id,
            ));
        }

        let apk: PathBuf = if sign {
            self.tools.sign(apk, trace_id)?
        } else {
            apk.to_path_buf()
        };
        let package = self.tools.package_name(&apk, trace_id)?;

        if self.is_package_installed(device_id, &package, trace_id)? {
            info!(trace_id = %trace_id, device_id = %device_id, package = %package, "package present; uninstalling first");
            self.uninstall(device_id, Some(&package), trace_id)?;
        }

        self.mark(device_id, &format!("Installing APK: {}", apk.display()), trace_id);
        let apk_arg = apk.to_string_lossy().to_string();
        // A timed-out install may still land; the package list decides.
        let installed = self.invoke(&device_args(device_id, &["install", apk_arg.as_str()]), trace_id);
        if let Err(err) = &installed {
            warn!(trace_id = %trace_id, device_id = %device_id, code = %err.code, "adb install did not finish cleanly: {}", err.error);
        }

        if !self.is_package_installed(device_id, &package, trace_id)? {
            warn!(trace_id = %trace_id, device_id = %device_id, package = %package, "install not verified");
            return Err(match installed {
                Ok(output) => AppError::tool(
                    format!("Could not install App, stderr: {}", output.stderr.trim()),
                    trace_id,
                ),
                Err(err) => err,
            });
        }
        self.registry.with_device(device_id, trace_id, |record| {
            record.last_installed_package = Some(package.clone());
        })?;
        info!(trace_id = %trace_id, device_id = %device_id, package = %package, "package installed");
        Ok(package)
    }

    /// Uninstalls `package`, or the tracked package when none is given.
    /// Returns the package that was removed.
    pub fn uninstall(
        &self,
        device_id: &str,
        package: Option<&str>,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let explicit = package.map(str::trim).filter(|value| !value.is_empty());
        let package = match explicit {
            Some(package) => {
                self.registry.with_device(device_id, trace_id, |record| {
                    if record.last_installed_package.as_deref() == Some(package) {
                        record.last_installed_package = None;
                    }
                })?;
                package.to_string()
            }
            None => self
                .registry
                .with_device(device_id, trace_id, |record| {
                    record.last_installed_package.take()
                })?
                .ok_or_else(|| AppError::not_found("Nothing to uninstall", trace_id))?,
        };

        self.mark(device_id, &format!("Uninstall: {package}"), trace_id);
        let output = self.invoke(&device_args(device_id, &["uninstall", package.as_str()]), trace_id)?;
        if !output.success() {
            return Err(AppError::tool(
                format!("Could not uninstall {package}: {}", output.diagnostic()),
                trace_id,
            ));
        }
        info!(trace_id = %trace_id, device_id = %device_id, package = %package, "package uninstalled");
        Ok(package)
    }

    /// Launches the tracked package and returns its pid once it shows up.
    pub fn run(
        &self,
        device_id: &str,
        custom_command: Option<&str>,
        trace_id: &str,
    ) -> Result<u32, AppError> {
        let package = self
            .tracked_package(device_id, trace_id)?
            .ok_or_else(|| AppError::validation("No APK installed!", trace_id))?;

        let mut args = device_args(device_id, &[]);
        match custom_command.map(str::trim).filter(|value| !value.is_empty()) {
            Some(command) => {
                info!(trace_id = %trace_id, device_id = %device_id, command = %command, "custom run command");
                args.extend(command.split_whitespace().map(str::to_string));
            }
            None => args.extend(
                ["shell", "monkey", "-p", package.as_str(), "-c", LAUNCHER_CATEGORY, "1"]
                    .iter()
                    .map(|item| item.to_string()),
            ),
        }

        self.mark(
            device_id,
            &format!("Starting APK: {package}, Device: {device_id}"),
            trace_id,
        );
        let output = self.invoke(&args, trace_id)?;
        if !output.success() {
            return Err(AppError::tool(
                format!("Could not start App: {}", output.diagnostic()),
                trace_id,
            ));
        }

        std::thread::sleep(self.adb.startup_grace());
        let pid = self
            .pidof(device_id, &package, trace_id)?
            .ok_or_else(|| AppError::tool("App not running, startup fail!", trace_id))?;
        self.registry.with_device(device_id, trace_id, |record| {
            record.running_pid = Some(pid);
        })?;
        info!(trace_id = %trace_id, device_id = %device_id, package = %package, pid, "app running");
        Ok(pid)
    }

    fn pidof(&self, device_id: &str, package: &str, trace_id: &str) -> Result<Option<u32>, AppError> {
        let output = self.invoke(&device_args(device_id, &["shell", "pidof", package]), trace_id)?;
        Ok(parse_pidof(&output.stdout))
    }

    /// Clears the tracked package's data, falling back to a force-stop when
    /// the clear does not report success.
    pub fn kill(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        let package = self
            .tracked_package(device_id, trace_id)?
            .ok_or_else(|| AppError::validation("No APK installed!", trace_id))?;

        self.mark(device_id, &format!("Stopping APP: {package}"), trace_id);
        let clear_failure = match self.invoke(
            &device_args(device_id, &["shell", "pm", "clear", package.as_str()]),
            trace_id,
        ) {
            Ok(output) if pm_clear_succeeded(&output.stdout, &output.stderr) => None,
            Ok(output) => Some(output.diagnostic().to_string()),
            Err(err) => Some(err.error),
        };

        let result = match clear_failure {
            None => Ok(()),
            Some(reason) => {
                warn!(trace_id = %trace_id, device_id = %device_id, package = %package, "pm clear failed: {reason}; forcing stop");
                self.mark(device_id, &format!("Stopped APP (ERROR): {package}"), trace_id);
                match self.invoke(
                    &device_args(device_id, &["shell", "am", "force-stop", package.as_str()]),
                    trace_id,
                ) {
                    Ok(output) if output.success() => Ok(()),
                    _ => Err(AppError::tool(
                        format!("Could not stop App: {reason}"),
                        trace_id,
                    )),
                }
            }
        };

        self.registry.with_device(device_id, trace_id, |record| {
            record.running_pid = None;
        })?;
        if result.is_ok() {
            self.mark(device_id, &format!("Stopped APP: {package}"), trace_id);
        }
        result
    }

    /// Clears the device log buffer and starts a capture. Returns its pid.
    pub fn start_logcat(&self, device_id: &str, trace_id: &str) -> Result<u32, AppError> {
        let running = self
            .registry
            .with_device(device_id, trace_id, |record| record.logcat.is_some())?;
        if running {
            return Err(AppError::validation("Logcat already running", trace_id));
        }

        match self.invoke(&device_args(device_id, &["logcat", "-c"]), trace_id) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                warn!(trace_id = %trace_id, device_id = %device_id, "logcat -c failed: {}", output.diagnostic())
            }
            Err(err) => warn!(trace_id = %trace_id, device_id = %device_id, "logcat -c failed: {err}"),
        }

        let session = {
            let _permit = self.gate.acquire();
            LogcatSession::start(
                self.runner.as_ref(),
                device_id,
                &self.logcat.capture_dir(),
                trace_id,
            )?
        };
        let pid = session.pid();

        let leftover = self.registry.with_device(device_id, trace_id, |record| {
            match record.logcat {
                Some(_) => Some(session),
                None => {
                    record.logcat = Some(session);
                    None
                }
            }
        });
        match leftover {
            Ok(None) => {}
            Ok(Some(session)) => {
                session.force_stop();
                return Err(AppError::validation("Logcat already running", trace_id));
            }
            Err(err) => return Err(err),
        }

        std::thread::sleep(Duration::from_millis(self.logcat.settle_ms));
        Ok(pid)
    }

    /// Stops the device's capture and returns the capture file path.
    pub fn stop_logcat(&self, device_id: &str, trace_id: &str) -> Result<PathBuf, AppError> {
        self.ensure_device(device_id, trace_id)?;
        self.mark(device_id, "Stopping logcat", trace_id);
        let session = self
            .registry
            .with_device(device_id, trace_id, |record| record.logcat.take())?
            .ok_or_else(|| AppError::not_found("Logcat not running", trace_id))?;
        let path = session.stop(
            Duration::from_millis(self.logcat.stop_grace_ms),
            trace_id,
        );
        info!(trace_id = %trace_id, device_id = %device_id, path = %path.display(), "logcat capture stopped");
        Ok(path)
    }
}
