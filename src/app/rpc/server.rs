//! Station host RPC service: accept loop and per-connection handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::app::adb::apk::{ApkTools, PackageFormat};
use crate::app::adb::locator::{resolve_tool_program, validate_tool_program};
use crate::app::adb::runner::AdbRunner;
use crate::app::config::StationConfig;
use crate::app::error::AppError;
use crate::app::models::HostInfo;
use crate::app::rpc::protocol::{
    read_chunk, Request, RequestEnvelope, Response, StreamFrame, CHUNK_SIZE,
};
use crate::app::rpc::wire::{read_frame, write_frame, ProtocolError};
use crate::app::station::executor::HostExecutor;
use crate::app::station::registry::DeviceRegistry;
use crate::app::station::storage::Storage;

/// Timeout for reading or writing a single frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a connection handler needs; built once at startup.
pub struct HostContext {
    pub executor: Arc<HostExecutor>,
    pub storage: Storage,
    pub started_at: DateTime<Utc>,
}

impl HostContext {
    pub fn new(executor: HostExecutor, storage: Storage) -> Self {
        let storage = storage.with_capture_dir(executor.capture_dir());
        Self {
            executor: Arc::new(executor),
            storage,
            started_at: Utc::now(),
        }
    }

    /// Wires the real adb runner and package tooling from configuration.
    pub fn from_config(config: &StationConfig, trace_id: &str) -> Result<Self, AppError> {
        let adb_program = resolve_tool_program(&config.adb.command_path, "adb");
        validate_tool_program(&adb_program)
            .map_err(|err| AppError::validation(err, trace_id))?;
        let storage = Storage::new(&config.server.storage_root, &config.server.upload_dir);
        storage.ensure_root(trace_id)?;

        let executor = HostExecutor::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(AdbRunner::new(adb_program)),
            Arc::new(ApkTools::new(config.apk_tools.clone())),
            config.adb.clone(),
            config.logcat.clone(),
        );
        Ok(Self::new(executor, storage))
    }

    fn host_info(&self) -> HostInfo {
        HostInfo {
            os: std::env::consts::OS.to_string(),
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            device_count: self.executor.registry().len(),
        }
    }
}

/// Accepts connections until the listener fails; one task per connection.
pub async fn serve(listener: TcpListener, ctx: Arc<HostContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("TCP connection from {}", addr);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = handle_connection(reader, writer, &ctx).await {
                        log_connection_error(err);
                    }
                });
            }
            Err(err) => error!("TCP accept error: {}", err),
        }
    }
}

fn log_connection_error(err: ProtocolError) {
    match err {
        ProtocolError::ConnectionClosed => debug!("Client disconnected"),
        ProtocolError::Timeout => warn!("Connection timeout"),
        _ => error!("Connection error: {}", err),
    }
}

async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    ctx: &Arc<HostContext>,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let envelope: RequestEnvelope = read_frame(&mut reader, FRAME_TIMEOUT).await?;
    let trace_id = if envelope.trace_id.trim().is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        envelope.trace_id
    };
    let name = envelope.request.name();
    info!(trace_id = %trace_id, request = name, "rpc request");

    match envelope.request {
        Request::UploadFile {
            filename,
            storage_path,
            data,
        } => {
            let response = match ctx.storage.upload_target(&storage_path, &filename, &trace_id) {
                Ok(target) => receive_stream(&mut reader, &target, data, &trace_id)
                    .await
                    .map(|()| Response::Stored {
                        path: ctx.storage.relative(&target),
                    }),
                Err(err) => {
                    discard_stream(&mut reader).await;
                    Err(err)
                }
            };
            respond(&mut writer, name, response, &trace_id).await
        }
        Request::UploadPackage { filename, data } => {
            let response = receive_package(ctx, &mut reader, &filename, data, &trace_id).await;
            respond(&mut writer, name, response, &trace_id).await
        }
        Request::PullFile { path } => send_file(ctx, &mut writer, &path, &trace_id).await,
        request => {
            let response = dispatch(ctx, request, &trace_id).await;
            respond(&mut writer, name, response, &trace_id).await
        }
    }
}

async fn respond<W>(
    writer: &mut W,
    name: &str,
    response: Result<Response, AppError>,
    trace_id: &str,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            warn!(trace_id = %trace_id, request = name, code = %err.code, "{}", err.error);
            Response::Error { error: err }
        }
    };
    write_frame(writer, &response, FRAME_TIMEOUT).await
}

/// Runs a blocking executor call off the async workers.
async fn blocking<T, F>(ctx: &Arc<HostContext>, trace_id: &str, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&HostExecutor, &str) -> Result<T, AppError> + Send + 'static,
{
    let executor = Arc::clone(&ctx.executor);
    let trace = trace_id.to_string();
    tokio::task::spawn_blocking(move || f(&executor, &trace))
        .await
        .map_err(|err| AppError::internal(format!("Device task failed: {err}"), trace_id))?
}

async fn dispatch(
    ctx: &Arc<HostContext>,
    request: Request,
    trace_id: &str,
) -> Result<Response, AppError> {
    match request {
        Request::ListDevices => {
            let devices = blocking(ctx, trace_id, |executor, trace| executor.list_devices(trace)).await?;
            Ok(Response::Devices { devices })
        }
        Request::Lease { count, device_ids } => {
            let device_ids = blocking(ctx, trace_id, move |executor, trace| {
                executor.lease(&device_ids, count, trace)
            })
            .await?;
            Ok(Response::Leased { device_ids })
        }
        Request::Release { device_id } => {
            blocking(ctx, trace_id, move |executor, trace| executor.release(&device_id, trace)).await?;
            Ok(Response::Ok)
        }
        Request::Install {
            device_id,
            package_path,
            sign,
        } => {
            let path = ctx.storage.resolve(&package_path, trace_id)?;
            let package = blocking(ctx, trace_id, move |executor, trace| {
                executor.install(&device_id, &path, sign, trace)
            })
            .await?;
            Ok(Response::Installed { package })
        }
        Request::Uninstall { device_id, package } => {
            let package = blocking(ctx, trace_id, move |executor, trace| {
                executor.uninstall(&device_id, package.as_deref(), trace)
            })
            .await?;
            Ok(Response::Uninstalled { package })
        }
        Request::IsPackageInstalled { device_id, package } => {
            let installed = blocking(ctx, trace_id, move |executor, trace| {
                executor.is_package_installed(&device_id, &package, trace)
            })
            .await?;
            Ok(Response::PackageQuery { installed })
        }
        Request::Run {
            device_id,
            execution_secs,
            custom_command,
        } => {
            let id = device_id.clone();
            let pid = blocking(ctx, trace_id, move |executor, trace| {
                executor.run(&id, custom_command.as_deref(), trace)
            })
            .await?;
            // No cancellation: the app runs for the full duration even if the
            // caller goes away.
            info!(trace_id = %trace_id, device_id = %device_id, pid, execution_secs, "app running; waiting");
            tokio::time::sleep(Duration::from_secs(execution_secs)).await;
            Ok(Response::Running { pid })
        }
        Request::Kill { device_id } => {
            blocking(ctx, trace_id, move |executor, trace| executor.kill(&device_id, trace)).await?;
            Ok(Response::Ok)
        }
        Request::StartLogcat { device_id } => {
            let pid = blocking(ctx, trace_id, move |executor, trace| {
                executor.start_logcat(&device_id, trace)
            })
            .await?;
            Ok(Response::LogcatStarted { pid })
        }
        Request::StopLogcat { device_id } => {
            let path = blocking(ctx, trace_id, move |executor, trace| {
                executor.stop_logcat(&device_id, trace)
            })
            .await?;
            Ok(Response::LogcatStopped {
                path: path.to_string_lossy().to_string(),
            })
        }
        Request::HostInfo => Ok(Response::HostInfo {
            info: ctx.host_info(),
        }),
        Request::UploadFile { .. } | Request::UploadPackage { .. } | Request::PullFile { .. } => {
            Err(AppError::internal("Streaming request routed to dispatch", trace_id))
        }
    }
}

fn check_chunk(data: &[u8], trace_id: &str) -> Result<(), AppError> {
    if data.len() > CHUNK_SIZE {
        return Err(AppError::transfer(
            format!("Chunk of {} bytes exceeds {CHUNK_SIZE}", data.len()),
            trace_id,
        ));
    }
    Ok(())
}

/// Writes the first chunk and every following chunk frame into `target`,
/// in arrival order, until the `End` frame.
async fn receive_stream<R>(
    reader: &mut R,
    target: &Path,
    first_chunk: Vec<u8>,
    trace_id: &str,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let mut ended = false;
    let result = write_stream(reader, target, first_chunk, &mut ended, trace_id).await;
    if result.is_err() {
        if !ended {
            discard_stream(reader).await;
        }
        let _ = fs::remove_file(target).await;
    }
    result
}

/// Reads and drops frames up to `End`, so the error answer is not lost to a
/// reset caused by unread client data.
async fn discard_stream<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    while let Ok(frame) = read_frame::<_, StreamFrame>(reader, FRAME_TIMEOUT).await {
        if frame == StreamFrame::End {
            break;
        }
    }
}

async fn write_stream<R>(
    reader: &mut R,
    target: &Path,
    first_chunk: Vec<u8>,
    ended: &mut bool,
    trace_id: &str,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
{
    let transfer = |err: std::io::Error| AppError::transfer(format!("Failed to write upload: {err}"), trace_id);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(transfer)?;
    }
    check_chunk(&first_chunk, trace_id)?;
    let mut file = fs::File::create(target).await.map_err(transfer)?;
    file.write_all(&first_chunk).await.map_err(transfer)?;
    let mut total = first_chunk.len();
    loop {
        let frame: StreamFrame = read_frame(reader, FRAME_TIMEOUT).await.map_err(|err| {
            *ended = true;
            AppError::transfer(format!("Upload stream broken: {err}"), trace_id)
        })?;
        match frame {
            StreamFrame::Chunk { data } => {
                check_chunk(&data, trace_id)?;
                file.write_all(&data).await.map_err(transfer)?;
                total += data.len();
            }
            StreamFrame::End => {
                *ended = true;
                break;
            }
        }
    }
    file.flush().await.map_err(transfer)?;
    debug!(trace_id = %trace_id, bytes = total, path = %target.display(), "upload stored");
    Ok(())
}

async fn receive_package<R>(
    ctx: &Arc<HostContext>,
    reader: &mut R,
    filename: &str,
    first_chunk: Vec<u8>,
    trace_id: &str,
) -> Result<Response, AppError>
where
    R: AsyncRead + Unpin,
{
    let (target, format) = match ctx.storage.package_target(filename, trace_id) {
        Ok(target) => target,
        Err(err) => {
            discard_stream(reader).await;
            return Err(err);
        }
    };
    receive_stream(reader, &target, first_chunk, trace_id).await?;
    let stored: PathBuf = match format {
        PackageFormat::Apk => target,
        PackageFormat::Bundle => {
            let bundle = target.clone();
            let converted = blocking(ctx, trace_id, move |executor, trace| {
                executor.tools().convert_bundle(&bundle, trace)
            })
            .await;
            match converted {
                Ok(apk) => apk,
                Err(err) => {
                    let _ = fs::remove_file(&target).await;
                    return Err(err);
                }
            }
        }
    };
    info!(trace_id = %trace_id, path = %stored.display(), "package stored");
    Ok(Response::Stored {
        path: ctx.storage.relative(&stored),
    })
}

/// Streams a file back in chunks. A missing file is answered with a single
/// error frame before any chunk.
async fn send_file<W>(
    ctx: &Arc<HostContext>,
    writer: &mut W,
    path: &str,
    trace_id: &str,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let opened = match ctx.storage.resolve(path, trace_id) {
        Ok(resolved) => match fs::File::open(&resolved).await {
            Ok(file) => Ok(file),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::not_found(format!("File not found: {path}"), trace_id))
            }
            Err(err) => Err(AppError::transfer(format!("Failed to open {path}: {err}"), trace_id)),
        },
        Err(err) => Err(err),
    };
    let mut file = match opened {
        Ok(file) => file,
        Err(err) => return respond(writer, "pull_file", Err(err), trace_id).await,
    };

    let mut sent = 0usize;
    loop {
        let chunk = match read_chunk(&mut file).await {
            Ok(chunk) => chunk,
            Err(err) => {
                let err = AppError::transfer(format!("Failed to read {path}: {err}"), trace_id);
                return respond(writer, "pull_file", Err(err), trace_id).await;
            }
        };
        if chunk.is_empty() {
            break;
        }
        sent += chunk.len();
        write_frame(writer, &Response::Chunk { data: chunk }, FRAME_TIMEOUT).await?;
    }
    debug!(trace_id = %trace_id, bytes = sent, path = %path, "file streamed");
    write_frame(writer, &Response::End, FRAME_TIMEOUT).await
}
