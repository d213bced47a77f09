use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::app::config::{AdbSettings, ClientSettings, LogcatSettings};
use crate::app::error::{ERR_NOT_FOUND, ERR_UNAVAILABLE, ERR_VALIDATION};
use crate::app::models::{DeviceFilter, ExecuteRequest};
use crate::app::orchestrator::execute::{execute_package, UPLOAD_FAILED_MESSAGE};
use crate::app::orchestrator::router::HostRouter;
use crate::app::rpc::client::StationClient;
use crate::app::rpc::protocol::CHUNK_SIZE;
use crate::app::rpc::server::{serve, HostContext};
use crate::app::station::executor::HostExecutor;
use crate::app::station::registry::DeviceRegistry;
use crate::app::station::storage::Storage;
use crate::app::station::test_support::{FakeAdb, FakePackageTools};

struct TestHost {
    name: String,
    adb: FakeAdb,
    ctx: Arc<HostContext>,
    addr: String,
    _dir: TempDir,
}

impl TestHost {
    fn client(&self) -> StationClient {
        StationClient::new(&self.name, &self.addr, ClientSettings::default())
    }

    fn leased_count(&self) -> usize {
        self.ctx.executor.registry().leased_count()
    }

    fn logcat_running(&self, device_id: &str) -> bool {
        self.ctx
            .executor
            .registry()
            .with_device(device_id, "test", |record| record.logcat.is_some())
            .unwrap_or(false)
    }
}

async fn spawn_host_with(
    name: &str,
    devices: &[(&str, &str)],
    storage_root: Option<PathBuf>,
    tools: FakePackageTools,
) -> TestHost {
    let dir = TempDir::new().expect("tmp");
    let adb = FakeAdb::with_devices(devices);
    let settings = AdbSettings {
        startup_grace_ms: 0,
        ..AdbSettings::default()
    };
    let logcat = LogcatSettings {
        capture_dir: dir.path().join("captures").to_string_lossy().to_string(),
        stop_grace_ms: 2000,
        settle_ms: 0,
    };
    let executor = HostExecutor::new(
        Arc::new(DeviceRegistry::new()),
        Arc::new(adb.clone()),
        Arc::new(tools),
        settings,
        logcat,
    );
    let root = storage_root.unwrap_or_else(|| dir.path().join("storage"));
    let ctx = Arc::new(HostContext::new(executor, Storage::new(root, "UploadedFiles")));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(serve(listener, Arc::clone(&ctx)));
    TestHost {
        name: name.to_string(),
        adb,
        ctx,
        addr,
        _dir: dir,
    }
}

async fn spawn_host(name: &str, devices: &[(&str, &str)]) -> TestHost {
    spawn_host_with(name, devices, None, FakePackageTools::default()).await
}

fn router_for(hosts: &[&TestHost]) -> HostRouter {
    HostRouter::new(hosts.iter().map(|host| host.client()))
}

fn write_package(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, b"PK\x03\x04 fake package").expect("write package");
    path
}

fn request(keys: &[&str]) -> ExecuteRequest {
    ExecuteRequest {
        execution_secs: 1,
        device_keys: keys.iter().map(|key| key.to_string()).collect(),
        sign: true,
        custom_command: None,
    }
}

#[tokio::test]
async fn single_device_run_succeeds_and_releases() {
    let host = spawn_host("A", &[("X", "device")]).await;
    let router = router_for(&[&host]);
    let work = TempDir::new().expect("tmp");
    let package = write_package(&work, "game.apk");

    let outcomes = execute_package(&router, &package, &request(&["X_A"]), "trace-1")
        .await
        .expect("execute");

    let outcome = outcomes.get("X_A").expect("outcome for X_A");
    assert!(!outcome.error, "unexpected failure: {}", outcome.message);
    assert_eq!(outcome.message, "");
    let log = outcome.log.as_deref().expect("log attached");
    assert!(log.contains("fake capture"));

    assert_eq!(host.leased_count(), 0);
    assert!(!host.logcat_running("X"));
    assert!(host.adb.installed("X").is_empty());
    let marks = host.adb.state().marks.clone();
    assert!(marks.iter().any(|mark| mark.starts_with("Installing APK:")));
    assert!(marks.iter().any(|mark| mark.starts_with("Starting APK:")));
}

#[tokio::test]
async fn lease_by_count_returns_what_is_free() {
    let host = spawn_host("A", &[("D1", "device"), ("D2", "device")]).await;
    let client = host.client();
    let leased = client.lease(3, Vec::new(), "trace").await.expect("lease");
    assert_eq!(leased, vec!["D1".to_string(), "D2".to_string()]);
    assert_eq!(host.leased_count(), 2);

    let err = client.lease(1, Vec::new(), "trace").await.expect_err("none free");
    assert_eq!(err.code, ERR_UNAVAILABLE);

    client.release("__ALL__", "trace").await.expect("release all");
    assert_eq!(host.leased_count(), 0);
}

#[tokio::test]
async fn install_failure_still_collects_log_and_releases() {
    let host = spawn_host("A", &[("X", "device")]).await;
    host.adb.state().fail_install = true;
    let router = router_for(&[&host]);
    let work = TempDir::new().expect("tmp");
    let package = write_package(&work, "game.apk");

    let outcomes = execute_package(&router, &package, &request(&["X_A"]), "trace")
        .await
        .expect("execute");
    let outcome = outcomes.get("X_A").expect("outcome");
    assert!(outcome.error);
    assert!(
        outcome.message.starts_with("Error install_app: Could not install App"),
        "{}",
        outcome.message
    );
    assert!(outcome.log.is_some(), "log should still be collected");
    assert_eq!(host.leased_count(), 0);
}

#[tokio::test]
async fn every_failing_stage_still_releases_and_stops_logcat() {
    type Inject = fn(&FakeAdb);
    let cases: [(&str, Inject); 5] = [
        ("Error start_logcat_collect:", |adb: &FakeAdb| adb.state().fail_capture = true),
        ("Error install_app:", |adb: &FakeAdb| adb.state().fail_install = true),
        ("App not running, startup fail!", |adb: &FakeAdb| adb.state().never_starts = true),
        ("Error kill_app:", |adb: &FakeAdb| {
            let mut state = adb.state();
            state.fail_clear = true;
            state.fail_force_stop = true;
        }),
        ("Error uninstall_app:", |adb: &FakeAdb| adb.state().fail_uninstall = true),
    ];

    for (expected, inject) in cases {
        let host = spawn_host("A", &[("X", "device")]).await;
        inject(&host.adb);
        let router = router_for(&[&host]);
        let work = TempDir::new().expect("tmp");
        let package = write_package(&work, "game.apk");

        let outcomes = execute_package(&router, &package, &request(&["X_A"]), "trace")
            .await
            .expect("execute");
        let outcome = outcomes.get("X_A").expect("outcome");
        assert!(outcome.error, "{expected}: run should fail");
        assert!(
            outcome.message.starts_with(expected),
            "expected '{expected}', got '{}'",
            outcome.message
        );
        assert_eq!(host.leased_count(), 0, "{expected}: lease leaked");
        assert!(!host.logcat_running("X"), "{expected}: logcat left running");
    }
}

#[tokio::test]
async fn upload_then_pull_reproduces_bytes() {
    let host = spawn_host("A", &[]).await;
    let client = host.client();
    let work = TempDir::new().expect("tmp");

    let payloads: [Vec<u8>; 3] = [
        Vec::new(),
        b"hello".to_vec(),
        (0..CHUNK_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect(),
    ];
    for (index, payload) in payloads.iter().enumerate() {
        let source = work.path().join(format!("payload-{index}.bin"));
        fs::write(&source, payload).expect("write payload");
        let stored = client
            .upload_file(&source, &format!("blob-{index}.bin"), "transfers/run1", "trace")
            .await
            .expect("upload");
        assert_eq!(stored, format!("transfers/run1/blob-{index}.bin"));
        let pulled = client.pull_file(&stored, "trace").await.expect("pull");
        assert_eq!(&pulled, payload, "payload {index} differs");
    }
}

#[tokio::test]
async fn pull_of_missing_file_is_not_found() {
    let host = spawn_host("A", &[]).await;
    let err = host
        .client()
        .pull_file("transfers/nothing.bin", "trace")
        .await
        .expect_err("missing");
    assert_eq!(err.code, ERR_NOT_FOUND);
}

#[tokio::test]
async fn pull_refuses_absolute_paths_outside_captures() {
    let outside = TempDir::new().expect("tempdir");
    let secret = outside.path().join("secret.txt");
    fs::write(&secret, b"host only").expect("write");
    let host = spawn_host("A", &[]).await;
    let err = host
        .client()
        .pull_file(&secret.to_string_lossy(), "trace")
        .await
        .expect_err("outside capture dir");
    assert_eq!(err.code, ERR_VALIDATION);
}

#[tokio::test]
async fn package_upload_names_files_and_converts_bundles() {
    let host = spawn_host("A", &[]).await;
    let client = host.client();
    let work = TempDir::new().expect("tmp");

    let apk = write_package(&work, "game.apk");
    let first = client.upload_package(&apk, "game.apk", "trace").await.expect("apk");
    let second = client.upload_package(&apk, "game.apk", "trace").await.expect("apk");
    assert!(first.starts_with("UploadedFiles/"));
    assert!(first.ends_with(".apk"));
    assert_ne!(first, second);

    let bundle = write_package(&work, "game.aab");
    let converted = client
        .upload_package(&bundle, "game.aab", "trace")
        .await
        .expect("aab");
    assert!(converted.starts_with("UploadedFiles/"));
    assert!(converted.ends_with("/universal.apk"));

    let text = write_package(&work, "notes.txt");
    let err = client
        .upload_package(&text, "notes.txt", "trace")
        .await
        .expect_err("txt");
    assert_eq!(err.code, ERR_VALIDATION);
}

#[tokio::test]
async fn slow_bundle_conversion_outlasts_the_request_timeout() {
    let tools = FakePackageTools::with_convert_delay(Duration::from_millis(1500));
    let host = spawn_host_with("A", &[], None, tools).await;
    let client = StationClient::new(
        "A",
        &host.addr,
        ClientSettings {
            request_timeout_secs: 1,
            package_timeout_secs: 5,
            ..ClientSettings::default()
        },
    );
    let work = TempDir::new().expect("tmp");
    let bundle = write_package(&work, "game.aab");

    let converted = client
        .upload_package(&bundle, "game.aab", "trace")
        .await
        .expect("conversion finishes within the package allowance");
    assert!(converted.ends_with("/universal.apk"));

    // plain uploads keep the short bound
    let source = write_package(&work, "blob.bin");
    client
        .upload_file(&source, "blob.bin", "transfers", "trace")
        .await
        .expect("upload");
}

#[tokio::test]
async fn refresh_is_idempotent_and_drops_unplugged_devices() {
    let host = spawn_host("A", &[("D1", "device"), ("D2", "device"), ("D3", "offline")]).await;
    let client = host.client();
    let first = client.list_devices("trace").await.expect("list");
    let second = client.list_devices("trace").await.expect("list again");
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);

    client.lease(1, vec!["D2".to_string()], "trace").await.expect("lease");
    host.adb.unplug("D2");
    let after = client.list_devices("trace").await.expect("list after unplug");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, "D1");
    assert_eq!(host.leased_count(), 0);
}

#[tokio::test]
async fn router_lists_across_hosts_and_skips_unreachable() {
    let a = spawn_host("A", &[("D1", "device"), ("D2", "device")]).await;
    let b = spawn_host("B", &[("D1", "device")]).await;
    let mut clients = vec![a.client(), b.client()];
    clients.push(StationClient::new(
        "DOWN",
        "127.0.0.1:1",
        ClientSettings {
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
            ..ClientSettings::default()
        },
    ));
    let router = HostRouter::new(clients);

    let all = router.list_devices(&DeviceFilter::default(), "trace").await;
    let keys: Vec<&str> = all.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["D1_A", "D2_A", "D1_B"]);
    assert_eq!(all["D1_B"].host, "B");

    let limited = router
        .list_devices(
            &DeviceFilter {
                max_count: 2,
                ..DeviceFilter::default()
            },
            "trace",
        )
        .await;
    assert_eq!(limited.len(), 2);

    let arm32 = router
        .list_devices(
            &DeviceFilter {
                architecture: Some("armeabi-v7a".to_string()),
                ..DeviceFilter::default()
            },
            "trace",
        )
        .await;
    assert!(arm32.is_empty());

    let by_key = router
        .list_devices(
            &DeviceFilter {
                device_keys: BTreeSet::from(["D1_B".to_string(), "D9_A".to_string()]),
                max_count: 0,
                ..DeviceFilter::default()
            },
            "trace",
        )
        .await;
    assert_eq!(by_key.keys().collect::<Vec<_>>(), vec!["D1_B"]);

    let probes = router.probe("trace").await;
    assert!(probes["A"].is_ok());
    assert!(probes["DOWN"].is_err());
}

#[tokio::test]
async fn upload_failure_marks_host_devices_and_releases_them() {
    let a = spawn_host("A", &[("X", "device")]).await;
    let blocker_dir = TempDir::new().expect("tmp");
    let blocker = blocker_dir.path().join("not-a-dir");
    fs::write(&blocker, b"file").expect("blocker");
    let b = spawn_host_with("B", &[("Y", "device")], Some(blocker), FakePackageTools::default()).await;
    let router = router_for(&[&a, &b]);
    let work = TempDir::new().expect("tmp");
    let package = write_package(&work, "game.apk");

    let outcomes = execute_package(&router, &package, &request(&["X_A", "Y_B"]), "trace")
        .await
        .expect("execute");
    assert!(!outcomes["X_A"].error, "{}", outcomes["X_A"].message);
    assert!(outcomes["Y_B"].error);
    assert_eq!(outcomes["Y_B"].message, UPLOAD_FAILED_MESSAGE);
    assert_eq!(a.leased_count(), 0);
    assert_eq!(b.leased_count(), 0);
}

#[tokio::test]
async fn request_validation_and_unknown_hosts() {
    let host = spawn_host("A", &[("X", "device")]).await;
    let router = router_for(&[&host]);
    let work = TempDir::new().expect("tmp");
    let package = write_package(&work, "game.apk");

    let mut zero = request(&["X_A"]);
    zero.execution_secs = 0;
    let err = execute_package(&router, &package, &zero, "trace").await.expect_err("zero");
    assert_eq!(err.code, ERR_VALIDATION);

    let err = execute_package(&router, &package, &request(&["X-A"]), "trace")
        .await
        .expect_err("malformed");
    assert_eq!(err.code, ERR_VALIDATION);

    let err = execute_package(&router, Path::new("/no/such/game.apk"), &request(&["X_A"]), "trace")
        .await
        .expect_err("missing package");
    assert_eq!(err.code, ERR_NOT_FOUND);

    let err = execute_package(&router, &package, &request(&["X_NOPE"]), "trace")
        .await
        .expect_err("nothing leased");
    assert_eq!(err.code, ERR_UNAVAILABLE);
    assert_eq!(err.error, "Could not lock any device");

    let outcomes = execute_package(&router, &package, &request(&["X_A", "Z_NOPE"]), "trace")
        .await
        .expect("partial");
    assert!(!outcomes["X_A"].error);
    assert!(outcomes["Z_NOPE"].error);
    assert_eq!(outcomes["Z_NOPE"].message, "Host not found: NOPE");
    assert_eq!(host.leased_count(), 0);
}

#[tokio::test]
async fn host_info_reports_registry_size() {
    let host = spawn_host("A", &[("D1", "device")]).await;
    let client = host.client();
    client.list_devices("trace").await.expect("list");
    let info = client.host_info("trace").await.expect("info");
    assert_eq!(info.os, std::env::consts::OS);
    assert_eq!(info.device_count, 1);
    assert!(!info.started_at.is_empty());
}
