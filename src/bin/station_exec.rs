use std::collections::BTreeSet;
use std::path::PathBuf;

use adb_teststation_lib::app::config::load_config_at;
use adb_teststation_lib::app::error::AppError;
use adb_teststation_lib::app::logging::init_logging;
use adb_teststation_lib::app::models::{DeviceFilter, ExecuteRequest};
use adb_teststation_lib::app::orchestrator::execute::execute_package;
use adb_teststation_lib::app::orchestrator::router::HostRouter;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

const USAGE: &str = "Usage:\n  station_exec [--config FILE] hosts\n  station_exec [--config FILE] devices [--arch ABI] [--ids KEY,KEY] [--amount N]\n  station_exec [--config FILE] execute PACKAGE --devices KEY,KEY --time SECS [--no-sign] [--cmd COMMAND]\n";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Hosts,
    Devices(DeviceFilter),
    Execute {
        package: PathBuf,
        request: ExecuteRequest,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn split_keys(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut it = raw.into_iter();
    let mut config = None;
    let mut subcommand = None;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config = Some(PathBuf::from(value));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => {
                subcommand = Some(arg);
                break;
            }
        }
    }

    let command = match subcommand.as_deref() {
        Some("hosts") => {
            if let Some(other) = it.next() {
                return Err(format!("Unknown arg: {other}"));
            }
            Command::Hosts
        }
        Some("devices") => {
            let mut filter = DeviceFilter::default();
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--arch" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--arch requires a value".to_string())?;
                        filter.architecture = Some(value.trim().to_string());
                    }
                    "--ids" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--ids requires a value".to_string())?;
                        filter.device_keys = split_keys(&value).collect::<BTreeSet<_>>();
                    }
                    "--amount" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--amount requires a value".to_string())?;
                        filter.max_count = value
                            .trim()
                            .parse()
                            .map_err(|_| format!("Invalid amount: {value}"))?;
                    }
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Devices(filter)
        }
        Some("execute") => {
            let package = it
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| "execute requires a package path".to_string())?;
            let mut request = ExecuteRequest {
                execution_secs: 0,
                device_keys: Vec::new(),
                sign: true,
                custom_command: None,
            };
            while let Some(arg) = it.next() {
                match arg.as_str() {
                    "--devices" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--devices requires a value".to_string())?;
                        request.device_keys = split_keys(&value).collect();
                    }
                    "--time" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--time requires a value".to_string())?;
                        request.execution_secs = value
                            .trim()
                            .parse()
                            .map_err(|_| format!("Invalid time: {value}"))?;
                    }
                    "--no-sign" => request.sign = false,
                    "--cmd" => {
                        let value = it
                            .next()
                            .ok_or_else(|| "--cmd requires a value".to_string())?;
                        request.custom_command =
                            Some(value.trim().to_string()).filter(|cmd| !cmd.is_empty());
                    }
                    other => return Err(format!("Unknown arg: {other}")),
                }
            }
            Command::Execute { package, request }
        }
        Some(other) => return Err(format!("Unknown command: {other}\n{USAGE}")),
        None => return Err(USAGE.to_string()),
    };
    Ok(Args { config, command })
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("Failed to encode output: {err}"),
    }
}

fn fail(err: &AppError) -> ! {
    print_json(&json!({ "error": err }));
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let config = match load_config_at(args.config.as_deref(), &trace_id) {
        Ok(config) => config,
        Err(err) => fail(&err),
    };
    init_logging(&config.server.log_level);

    let router = HostRouter::from_config(&config);
    if router.is_empty() {
        fail(&AppError::validation(
            "No hosts configured; set STATION_HOST_<NAME>=addr:port",
            &trace_id,
        ));
    }

    match args.command {
        Command::Hosts => {
            let probes = router.probe(&trace_id).await;
            let report: serde_json::Map<String, serde_json::Value> = probes
                .into_iter()
                .map(|(host, result)| {
                    let value = match result {
                        Ok(info) => json!({ "ok": true, "info": info }),
                        Err(err) => json!({ "ok": false, "error": err }),
                    };
                    (host, value)
                })
                .collect();
            print_json(&report);
        }
        Command::Devices(filter) => {
            let devices = router.list_devices(&filter, &trace_id).await;
            print_json(&devices);
        }
        Command::Execute { package, request } => {
            match execute_package(&router, &package, &request, &trace_id).await {
                Ok(outcomes) => {
                    print_json(&outcomes);
                    if outcomes.values().any(|outcome| outcome.error) {
                        std::process::exit(3);
                    }
                }
                Err(err) => fail(&err),
            }
        }
    }
}
