//! Engine lifecycle against shell-script engines
#![cfg(unix)]

use geotunnel::config::TunnelConfigBuilder;
use geotunnel::outbound::decode;
use geotunnel::supervisor::{EngineSupervisor, HandleState, Liveness, ProcessSupervisor};
use geotunnel::{ManagerState, ProxyEndpoint, Settings, TunnelManager};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;

/// Scripts are written then executed; keep that sequential within this binary
static SERIAL: Mutex<()> = Mutex::const_new(());

const LIVE_ENGINE: &str = "#!/bin/sh\necho \"engine up: $@\"\nwhile true; do sleep 1; done\n";
const DEAD_ENGINE: &str = "#!/bin/sh\necho \"config rejected\" >&2\nexit 23\n";
const BINARY_NOISE_ENGINE: &str = "#!/bin/sh\n\
    echo \"first line\" >&2\n\
    printf 'bad \\377 byte\\n' >&2\n\
    echo \"listen failed: address in use\" >&2\n\
    exit 1\n";

fn settings(dir: &Path, engine_name: &str) -> Settings {
    Settings {
        data_dir: Some(dir.to_path_buf()),
        engine_name: engine_name.to_string(),
        socks_port: 21808,
        settle_delay: 300,
        stop_timeout: 2,
        sweep_delay: 0,
        ..Default::default()
    }
}

fn install_engine(settings: &Settings, script: &str) {
    let path = settings.engine_path();
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn is_running(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_live_engine_start_probe_stop() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtlive");
    install_engine(&settings, LIVE_ENGINE);

    let supervisor = ProcessSupervisor::from_settings(&settings);
    let binary = supervisor.ensure_binary().await.unwrap();
    assert_eq!(binary, settings.engine_path());

    let config = TunnelConfigBuilder::from_settings(&settings)
        .build(&decode("vless://uuid@host:443?security=tls&sni=example.com").unwrap());
    let mut handle = supervisor.start(&binary, &config).await.unwrap();

    let config_path = handle.config_path().to_path_buf();
    let pid = handle.pid().unwrap();
    assert!(config_path.exists());
    assert!(config_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with(".json"));
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    assert_eq!(written["inbounds"][0]["port"], 21808);

    assert!(supervisor.probe(&mut handle).await.is_live());
    assert_eq!(handle.state(), HandleState::Live);

    supervisor.stop(handle).await;
    assert!(!config_path.exists());
    assert!(!is_running(pid));
}

#[tokio::test]
async fn test_dead_engine_reports_output() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtdead");
    install_engine(&settings, DEAD_ENGINE);
    std::fs::write(settings.engine_log_path(), "stale line from an earlier run\n").unwrap();

    let supervisor = ProcessSupervisor::from_settings(&settings);
    let config = TunnelConfigBuilder::from_settings(&settings)
        .build(&decode("vless://uuid@host:443").unwrap());
    let mut handle = supervisor
        .start(&settings.engine_path(), &config)
        .await
        .unwrap();
    let config_path = handle.config_path().to_path_buf();

    match supervisor.probe(&mut handle).await {
        Liveness::Dead(report) => {
            assert_eq!(report.exit_code, Some(23));
            assert!(report.stderr.contains("config rejected"));
            // The engine log is cleared before each launch
            assert_eq!(report.engine_log, None);
        }
        Liveness::Live => panic!("engine should have exited"),
    }
    assert_eq!(handle.state(), HandleState::Dead);

    // Stop is safe on a dead handle and still removes the config
    supervisor.stop(handle).await;
    assert!(!config_path.exists());
}

#[tokio::test]
async fn test_invalid_utf8_output_does_not_truncate_report() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtnoise");
    install_engine(&settings, BINARY_NOISE_ENGINE);

    let supervisor = ProcessSupervisor::from_settings(&settings);
    let config = TunnelConfigBuilder::from_settings(&settings)
        .build(&decode("vless://uuid@host:443").unwrap());
    let mut handle = supervisor
        .start(&settings.engine_path(), &config)
        .await
        .unwrap();

    match supervisor.probe(&mut handle).await {
        Liveness::Dead(report) => {
            assert_eq!(report.exit_code, Some(1));
            assert!(report.stderr.starts_with("first line\nbad "));
            assert!(report.stderr.contains('\u{FFFD}'));
            assert!(report.stderr.contains("listen failed: address in use"));
        }
        Liveness::Live => panic!("engine should have exited"),
    }
    supervisor.stop(handle).await;
}

#[tokio::test]
async fn test_previous_config_is_removed_on_next_start() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtretry");
    install_engine(&settings, DEAD_ENGINE);

    let supervisor = ProcessSupervisor::from_settings(&settings);
    let config = TunnelConfigBuilder::from_settings(&settings)
        .build(&decode("vless://uuid@host:443").unwrap());

    let first = supervisor
        .start(&settings.engine_path(), &config)
        .await
        .unwrap();
    let first_path = first.config_path().to_path_buf();
    // Leak the handle's cleanup; the next start must still remove the file
    std::mem::forget(first);

    let second = supervisor
        .start(&settings.engine_path(), &config)
        .await
        .unwrap();
    assert!(!first_path.exists());
    assert_ne!(first_path, second.config_path());
    supervisor.stop(second).await;
}

#[tokio::test]
async fn test_stray_engine_is_killed_before_start() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtstray");
    install_engine(&settings, LIVE_ENGINE);

    let mut stray = std::process::Command::new(settings.engine_path())
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let supervisor = ProcessSupervisor::from_settings(&settings);
    let config = TunnelConfigBuilder::from_settings(&settings)
        .build(&decode("vless://uuid@host:443").unwrap());
    let mut handle = supervisor
        .start(&settings.engine_path(), &config)
        .await
        .unwrap();

    let mut exited = false;
    for _ in 0..20 {
        if stray.try_wait().unwrap().is_some() {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(exited, "stray engine survived the sweep");

    assert!(supervisor.probe(&mut handle).await.is_live());
    supervisor.stop(handle).await;
}

#[tokio::test]
async fn test_manager_end_to_end_from_cache() {
    let _guard = SERIAL.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), "gtmgr");
    install_engine(&settings, LIVE_ENGINE);
    // No subscription url: candidates come from the cache
    std::fs::write(
        settings.cache_path(),
        "trojan://pw@t:443\nvless://uuid@host:443?security=tls&sni=example.com\n",
    )
    .unwrap();

    let manager = TunnelManager::from_settings(&settings);
    let endpoint = manager.get_proxy().await;
    assert_eq!(endpoint, Some(ProxyEndpoint::loopback(21808)));
    assert_eq!(manager.state(), ManagerState::Live);
    assert_eq!(manager.get_proxy().await, endpoint);

    manager.shutdown().await;
    manager.shutdown().await;
    assert_eq!(manager.state(), ManagerState::Idle);

    let leftovers = std::fs::read_dir(std::env::temp_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("gtmgr_"))
        .count();
    assert_eq!(leftovers, 0);
}
