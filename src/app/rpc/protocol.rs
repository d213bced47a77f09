//! Messages exchanged between the orchestrator and a station host.
//!
//! One request per connection. Uploads continue with [`StreamFrame`]s after
//! the request frame; pulls are answered with chunk frames then `End`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::app::error::AppError;
use crate::app::models::{DeviceSnapshot, HostInfo};

/// Largest payload fragment carried by one chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub trace_id: String,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    ListDevices,
    Lease {
        count: usize,
        #[serde(default)]
        device_ids: Vec<String>,
    },
    Release {
        device_id: String,
    },
    Install {
        device_id: String,
        package_path: String,
        sign: bool,
    },
    Uninstall {
        device_id: String,
        #[serde(default)]
        package: Option<String>,
    },
    IsPackageInstalled {
        device_id: String,
        package: String,
    },
    /// Launches the tracked package and keeps it running for
    /// `execution_secs` before answering.
    Run {
        device_id: String,
        execution_secs: u64,
        #[serde(default)]
        custom_command: Option<String>,
    },
    Kill {
        device_id: String,
    },
    StartLogcat {
        device_id: String,
    },
    StopLogcat {
        device_id: String,
    },
    UploadFile {
        filename: String,
        storage_path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    UploadPackage {
        filename: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    PullFile {
        path: String,
    },
    HostInfo,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ListDevices => "list_devices",
            Request::Lease { .. } => "lease",
            Request::Release { .. } => "release",
            Request::Install { .. } => "install",
            Request::Uninstall { .. } => "uninstall",
            Request::IsPackageInstalled { .. } => "is_package_installed",
            Request::Run { .. } => "run",
            Request::Kill { .. } => "kill",
            Request::StartLogcat { .. } => "start_logcat",
            Request::StopLogcat { .. } => "stop_logcat",
            Request::UploadFile { .. } => "upload_file",
            Request::UploadPackage { .. } => "upload_package",
            Request::PullFile { .. } => "pull_file",
            Request::HostInfo => "host_info",
        }
    }
}

/// Follow-up frames of an upload stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Chunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Devices {
        devices: Vec<DeviceSnapshot>,
    },
    Leased {
        device_ids: Vec<String>,
    },
    Installed {
        package: String,
    },
    PackageQuery {
        installed: bool,
    },
    Running {
        pid: u32,
    },
    Uninstalled {
        package: String,
    },
    LogcatStarted {
        pid: u32,
    },
    LogcatStopped {
        path: String,
    },
    Stored {
        path: String,
    },
    Chunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    End,
    HostInfo {
        info: HostInfo,
    },
    Error {
        error: AppError,
    },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ok => "ok",
            Response::Devices { .. } => "devices",
            Response::Leased { .. } => "leased",
            Response::Installed { .. } => "installed",
            Response::PackageQuery { .. } => "package_query",
            Response::Running { .. } => "running",
            Response::Uninstalled { .. } => "uninstalled",
            Response::LogcatStarted { .. } => "logcat_started",
            Response::LogcatStopped { .. } => "logcat_stopped",
            Response::Stored { .. } => "stored",
            Response::Chunk { .. } => "chunk",
            Response::End => "end",
            Response::HostInfo { .. } => "host_info",
            Response::Error { .. } => "error",
        }
    }
}

/// Reads up to one chunk; a short chunk means end of input, an empty one
/// means nothing was left.
pub async fn read_chunk<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
