use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use adb_teststation_lib::app::config::load_config_at;
use adb_teststation_lib::app::logging::init_logging;
use adb_teststation_lib::app::rpc::server::{serve, HostContext};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Args {
    port: Option<u16>,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--port requires a value".to_string())?;
                let port = value
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| format!("Invalid port: {value}"))?;
                args.port = Some(port);
            }
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                args.config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => {
                return Err("Usage: station_host [-p|--port PORT] [--config FILE]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn listen_addr(configured: &str, port: Option<u16>) -> Result<SocketAddr, String> {
    let mut addr: SocketAddr = configured
        .trim()
        .parse()
        .map_err(|err| format!("Invalid listen address {configured}: {err}"))?;
    if let Some(port) = port {
        addr.set_port(port);
    }
    Ok(addr)
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let config = match load_config_at(args.config.as_deref(), &trace_id) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config: {err}");
            std::process::exit(1);
        }
    };
    init_logging(&config.server.log_level);

    let addr = match listen_addr(&config.server.listen_addr, args.port) {
        Ok(addr) => addr,
        Err(msg) => {
            error!(trace_id = %trace_id, "{msg}");
            std::process::exit(2);
        }
    };

    let ctx = match HostContext::from_config(&config, &trace_id) {
        Ok(ctx) => Arc::new(ctx),
        Err(err) => {
            error!(trace_id = %trace_id, code = %err.code, "Failed to start host: {}", err.error);
            std::process::exit(1);
        }
    };

    let executor = Arc::clone(&ctx.executor);
    let refresh_trace = trace_id.clone();
    match tokio::task::spawn_blocking(move || executor.refresh(&refresh_trace)).await {
        Ok(Ok(())) => {
            info!(trace_id = %trace_id, devices = ctx.executor.registry().len(), "initial device refresh done")
        }
        Ok(Err(err)) => {
            warn!(trace_id = %trace_id, code = %err.code, "initial device refresh failed: {}", err.error)
        }
        Err(err) => warn!(trace_id = %trace_id, "initial device refresh task failed: {err}"),
    }

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(trace_id = %trace_id, addr = %addr, "Failed to bind: {err}");
            std::process::exit(1);
        }
    };
    info!(
        trace_id = %trace_id,
        addr = %addr,
        storage_root = %ctx.storage.root().display(),
        "station host listening"
    );

    let server = tokio::spawn(serve(listener, Arc::clone(&ctx)));
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(trace_id = %trace_id, "failed to wait for shutdown signal: {err}");
    }
    info!(trace_id = %trace_id, "shutting down");
    server.abort();

    let leased = ctx.executor.registry().leased_count();
    if leased > 0 {
        warn!(trace_id = %trace_id, leased, "shutting down with leased devices");
    }
}
