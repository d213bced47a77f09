//! Orchestrator-side client for one station host.

use std::path::Path;
use std::time::Duration;

use tokio::fs;
use tokio::net::TcpStream;
use tracing::debug;

use crate::app::config::ClientSettings;
use crate::app::error::AppError;
use crate::app::models::{DeviceSnapshot, HostInfo};
use crate::app::rpc::protocol::{
    read_chunk, Request, RequestEnvelope, Response, StreamFrame, CHUNK_SIZE,
};
use crate::app::rpc::wire::{read_frame, write_frame, ProtocolError};

#[derive(Debug, Clone)]
pub struct StationClient {
    name: String,
    addr: String,
    settings: ClientSettings,
}

impl StationClient {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, settings: ClientSettings) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }

    async fn connect(&self, trace_id: &str) -> Result<TcpStream, AppError> {
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        match tokio::time::timeout(timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => Err(AppError::unavailable(
                format!("Host {} ({}) unreachable: {err}", self.name, self.addr),
                trace_id,
            )),
            Err(_) => Err(AppError::unavailable(
                format!("Host {} ({}) connect timed out", self.name, self.addr),
                trace_id,
            )),
        }
    }

    fn protocol_error(&self, err: ProtocolError, trace_id: &str) -> AppError {
        match err {
            ProtocolError::Timeout => {
                AppError::unavailable(format!("Host {} timed out", self.name), trace_id)
            }
            other => AppError::transfer(format!("Host {}: {other}", self.name), trace_id),
        }
    }

    fn unexpected(&self, request: &str, response: &Response, trace_id: &str) -> AppError {
        AppError::transfer(
            format!(
                "Host {} answered {} with unexpected {} frame",
                self.name,
                request,
                response.kind()
            ),
            trace_id,
        )
    }

    /// One request, one response. Host-side errors come back unchanged.
    async fn call(
        &self,
        request: Request,
        timeout: Duration,
        trace_id: &str,
    ) -> Result<Response, AppError> {
        let name = request.name();
        debug!(trace_id = %trace_id, host = %self.name, request = name, "rpc call");
        let stream = self.connect(trace_id).await?;
        let (mut reader, mut writer) = stream.into_split();
        let envelope = RequestEnvelope {
            trace_id: trace_id.to_string(),
            request,
        };
        write_frame(&mut writer, &envelope, self.request_timeout())
            .await
            .map_err(|err| self.protocol_error(err, trace_id))?;
        let response: Response = read_frame(&mut reader, timeout)
            .await
            .map_err(|err| self.protocol_error(err, trace_id))?;
        match response {
            Response::Error { error } => Err(error),
            other => Ok(other),
        }
    }

    pub async fn host_info(&self, trace_id: &str) -> Result<HostInfo, AppError> {
        match self
            .call(Request::HostInfo, self.request_timeout(), trace_id)
            .await?
        {
            Response::HostInfo { info } => Ok(info),
            other => Err(self.unexpected("host_info", &other, trace_id)),
        }
    }

    pub async fn list_devices(&self, trace_id: &str) -> Result<Vec<DeviceSnapshot>, AppError> {
        match self
            .call(Request::ListDevices, self.request_timeout(), trace_id)
            .await?
        {
            Response::Devices { devices } => Ok(devices),
            other => Err(self.unexpected("list_devices", &other, trace_id)),
        }
    }

    pub async fn lease(
        &self,
        count: usize,
        device_ids: Vec<String>,
        trace_id: &str,
    ) -> Result<Vec<String>, AppError> {
        let request = Request::Lease { count, device_ids };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::Leased { device_ids } => Ok(device_ids),
            other => Err(self.unexpected("lease", &other, trace_id)),
        }
    }

    pub async fn release(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        let request = Request::Release {
            device_id: device_id.to_string(),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::Ok => Ok(()),
            other => Err(self.unexpected("release", &other, trace_id)),
        }
    }

    pub async fn install(
        &self,
        device_id: &str,
        package_path: &str,
        sign: bool,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let request = Request::Install {
            device_id: device_id.to_string(),
            package_path: package_path.to_string(),
            sign,
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::Installed { package } => Ok(package),
            other => Err(self.unexpected("install", &other, trace_id)),
        }
    }

    pub async fn uninstall(
        &self,
        device_id: &str,
        package: Option<&str>,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let request = Request::Uninstall {
            device_id: device_id.to_string(),
            package: package.map(str::to_string),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::Uninstalled { package } => Ok(package),
            other => Err(self.unexpected("uninstall", &other, trace_id)),
        }
    }

    pub async fn is_package_installed(
        &self,
        device_id: &str,
        package: &str,
        trace_id: &str,
    ) -> Result<bool, AppError> {
        let request = Request::IsPackageInstalled {
            device_id: device_id.to_string(),
            package: package.to_string(),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::PackageQuery { installed } => Ok(installed),
            other => Err(self.unexpected("is_package_installed", &other, trace_id)),
        }
    }

    /// Returns after the host has kept the app running for `execution_secs`.
    pub async fn run(
        &self,
        device_id: &str,
        execution_secs: u64,
        custom_command: Option<&str>,
        trace_id: &str,
    ) -> Result<u32, AppError> {
        let request = Request::Run {
            device_id: device_id.to_string(),
            execution_secs,
            custom_command: custom_command.map(str::to_string),
        };
        let timeout = self.request_timeout() + Duration::from_secs(execution_secs);
        match self.call(request, timeout, trace_id).await? {
            Response::Running { pid } => Ok(pid),
            other => Err(self.unexpected("run", &other, trace_id)),
        }
    }

    pub async fn kill(&self, device_id: &str, trace_id: &str) -> Result<(), AppError> {
        let request = Request::Kill {
            device_id: device_id.to_string(),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::Ok => Ok(()),
            other => Err(self.unexpected("kill", &other, trace_id)),
        }
    }

    pub async fn start_logcat(&self, device_id: &str, trace_id: &str) -> Result<u32, AppError> {
        let request = Request::StartLogcat {
            device_id: device_id.to_string(),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::LogcatStarted { pid } => Ok(pid),
            other => Err(self.unexpected("start_logcat", &other, trace_id)),
        }
    }

    pub async fn stop_logcat(&self, device_id: &str, trace_id: &str) -> Result<String, AppError> {
        let request = Request::StopLogcat {
            device_id: device_id.to_string(),
        };
        match self.call(request, self.request_timeout(), trace_id).await? {
            Response::LogcatStopped { path } => Ok(path),
            other => Err(self.unexpected("stop_logcat", &other, trace_id)),
        }
    }

    /// Streams `source` to `<storage_path>/<filename>` on the host and returns
    /// the stored path relative to the host's storage root.
    pub async fn upload_file(
        &self,
        source: &Path,
        filename: &str,
        storage_path: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let filename = filename.to_string();
        let storage_path = storage_path.to_string();
        self.upload(
            source,
            move |data| Request::UploadFile {
                filename,
                storage_path,
                data,
            },
            self.request_timeout(),
            trace_id,
        )
        .await
    }

    /// Streams a package; the host picks the stored name and converts
    /// bundles, returning the installable path.
    pub async fn upload_package(
        &self,
        source: &Path,
        filename: &str,
        trace_id: &str,
    ) -> Result<String, AppError> {
        let filename = filename.to_string();
        let answer_timeout =
            self.request_timeout() + Duration::from_secs(self.settings.package_timeout_secs);
        self.upload(
            source,
            move |data| Request::UploadPackage { filename, data },
            answer_timeout,
            trace_id,
        )
        .await
    }

    async fn upload<F>(
        &self,
        source: &Path,
        make_request: F,
        answer_timeout: Duration,
        trace_id: &str,
    ) -> Result<String, AppError>
    where
        F: FnOnce(Vec<u8>) -> Request,
    {
        let mut file = fs::File::open(source).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                AppError::not_found(format!("File not found: {}", source.display()), trace_id)
            } else {
                AppError::transfer(format!("Failed to open {}: {err}", source.display()), trace_id)
            }
        })?;
        let first = read_chunk(&mut file).await.map_err(|err| {
            AppError::transfer(format!("Failed to read {}: {err}", source.display()), trace_id)
        })?;

        let request = make_request(first);
        let name = request.name();
        let stream = self.connect(trace_id).await?;
        let (mut reader, mut writer) = stream.into_split();
        let envelope = RequestEnvelope {
            trace_id: trace_id.to_string(),
            request,
        };
        let timeout = self.request_timeout();
        let sent: Result<(), ProtocolError> = async {
            write_frame(&mut writer, &envelope, timeout).await?;
            loop {
                let chunk = read_chunk(&mut file).await?;
                if chunk.is_empty() {
                    break;
                }
                write_frame(&mut writer, &StreamFrame::Chunk { data: chunk }, timeout).await?;
            }
            write_frame(&mut writer, &StreamFrame::End, timeout).await
        }
        .await;

        // The host may have rejected the upload early; its answer wins over
        // a broken pipe on our side.
        let response: Result<Response, ProtocolError> =
            read_frame(&mut reader, answer_timeout).await;
        match (sent, response) {
            (_, Ok(Response::Error { error })) => Err(error),
            (Ok(()), Ok(Response::Stored { path })) => Ok(path),
            (Err(err), _) => Err(self.protocol_error(err, trace_id)),
            (Ok(()), Ok(other)) => Err(self.unexpected(name, &other, trace_id)),
            (Ok(()), Err(err)) => Err(self.protocol_error(err, trace_id)),
        }
    }

    /// Pulls a file from the host into memory.
    pub async fn pull_file(&self, path: &str, trace_id: &str) -> Result<Vec<u8>, AppError> {
        let stream = self.connect(trace_id).await?;
        let (mut reader, mut writer) = stream.into_split();
        let envelope = RequestEnvelope {
            trace_id: trace_id.to_string(),
            request: Request::PullFile {
                path: path.to_string(),
            },
        };
        let timeout = self.request_timeout();
        write_frame(&mut writer, &envelope, timeout)
            .await
            .map_err(|err| self.protocol_error(err, trace_id))?;

        let mut content = Vec::new();
        loop {
            let frame: Response = read_frame(&mut reader, timeout)
                .await
                .map_err(|err| self.protocol_error(err, trace_id))?;
            match frame {
                Response::Chunk { data } => {
                    if data.len() > CHUNK_SIZE {
                        return Err(AppError::transfer(
                            format!("Chunk of {} bytes exceeds {CHUNK_SIZE}", data.len()),
                            trace_id,
                        ));
                    }
                    content.extend_from_slice(&data);
                }
                Response::End => break,
                Response::Error { error } => return Err(error),
                other => return Err(self.unexpected("pull_file", &other, trace_id)),
            }
        }
        Ok(content)
    }
}
