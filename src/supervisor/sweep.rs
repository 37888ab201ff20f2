//! Stray engine sweep
//!
//! A crashed host can leave an engine behind that still owns the SOCKS
//! port. Before every launch we kill anything running under the engine's
//! executable name.

use std::ffi::OsStr;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Whether a process name belongs to the engine named `engine_name`.
///
/// Compares the executable stem case-insensitively, so `xray`, `xray.exe`
/// and `Xray.EXE` all match `xray` while `xray-helper` does not.
pub fn is_engine_process(process_name: &OsStr, engine_name: &str) -> bool {
    let name = process_name.to_string_lossy().to_lowercase();
    let stem = name.strip_suffix(".exe").unwrap_or(&name);
    !engine_name.is_empty() && stem == engine_name.to_lowercase()
}

/// Kill every running process named like the engine, except ourselves.
///
/// Returns the number of processes signalled.
pub fn kill_stray_engines(engine_name: &str) -> usize {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = sysinfo::get_current_pid().ok();
    let mut killed = 0;

    for (pid, process) in sys.processes() {
        if Some(*pid) == own_pid || !is_engine_process(process.name(), engine_name) {
            continue;
        }
        if process.kill() {
            debug!("Killed stray engine process {}", pid);
            killed += 1;
        } else {
            warn!("Failed to kill stray engine process {}", pid);
        }
    }

    killed
}

/// Run [`kill_stray_engines`] off the async runtime
pub async fn sweep(engine_name: &str) -> usize {
    let name = engine_name.to_string();
    match tokio::task::spawn_blocking(move || kill_stray_engines(&name)).await {
        Ok(killed) => killed,
        Err(e) => {
            warn!("Engine sweep task failed: {}", e);
            0
        }
    }
}
