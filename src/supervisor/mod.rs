//! Engine process supervisor
//!
//! Owns the lifecycle of the external engine executable:
//! - Locating or downloading the binary ([`binary`])
//! - Killing strays from earlier runs ([`sweep`])
//! - Launching one engine per candidate with a fresh config file
//! - Liveness probing with full output capture on early exit
//! - Graceful stop with a bounded wait, then kill

pub mod binary;
pub mod sweep;

pub use binary::BinaryManager;

use crate::common::{BinaryError, StartError};
use crate::config::{Settings, TunnelConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// How long to wait for the output readers after the engine has exited
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Windows `CREATE_NO_WINDOW` process creation flag
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Lifecycle operations the tunnel manager needs from an engine runner
#[async_trait]
pub trait EngineSupervisor: Send + Sync {
    type Handle: Send;

    /// Make sure the engine executable is present and return its path
    async fn ensure_binary(&self) -> Result<PathBuf, BinaryError>;

    /// Launch the engine for one configuration and wait out the settle time
    async fn start(&self, binary: &Path, config: &TunnelConfig)
        -> Result<Self::Handle, StartError>;

    /// Check whether the engine behind `handle` is still running
    async fn probe(&self, handle: &mut Self::Handle) -> Liveness;

    /// Terminate the engine and release its config file. Safe on a dead handle.
    async fn stop(&self, handle: Self::Handle);
}

/// Outcome of a liveness probe
#[derive(Debug, Clone)]
pub enum Liveness {
    Live,
    Dead(ExitReport),
}

impl Liveness {
    pub fn is_live(&self) -> bool {
        matches!(self, Liveness::Live)
    }
}

/// Everything an engine left behind when it died
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Contents of the engine's own error log, if it wrote one
    pub engine_log: Option<String>,
}

impl ExitReport {
    /// Multi-line diagnostic text, untruncated
    pub fn diagnostics(&self) -> String {
        let mut out = format!("{}", self);
        for (label, text) in [
            ("stdout", Some(self.stdout.as_str())),
            ("stderr", Some(self.stderr.as_str())),
            ("engine log", self.engine_log.as_deref()),
        ] {
            if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                out.push_str(&format!("\n--- {} ---\n{}", label, text.trim_end()));
            }
        }
        out
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// Handle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Launched, not yet probed
    Starting,
    /// Probed and running
    Live,
    /// Exited
    Dead,
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleState::Starting => write!(f, "starting"),
            HandleState::Live => write!(f, "live"),
            HandleState::Dead => write!(f, "dead"),
        }
    }
}

/// Engine output collected while starting
#[derive(Debug, Default)]
struct OutputCapture {
    active: bool,
    stdout: String,
    stderr: String,
}

/// One running (or exited) engine process and the config file backing it
pub struct TunnelProcessHandle {
    child: Child,
    pid: Option<u32>,
    config_path: PathBuf,
    state: HandleState,
    capture: Arc<Mutex<OutputCapture>>,
    readers: Vec<JoinHandle<()>>,
}

impl TunnelProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    fn set_state(&mut self, state: HandleState) {
        if self.state != state {
            debug!("Engine {:?} state: {} -> {}", self.pid, self.state, state);
            self.state = state;
        }
    }

    /// Stop capturing output; lines are still forwarded to the log
    fn release_capture(&self) {
        let mut capture = self.capture.lock();
        capture.active = false;
        capture.stdout.clear();
        capture.stderr.clear();
    }

    async fn collect_report(&mut self, status: Option<ExitStatus>, engine_log: &Path) -> ExitReport {
        for reader in self.readers.drain(..) {
            if timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Engine output reader did not finish in time");
            }
        }

        let (stdout, stderr) = {
            let mut capture = self.capture.lock();
            capture.active = false;
            (
                std::mem::take(&mut capture.stdout),
                std::mem::take(&mut capture.stderr),
            )
        };

        let engine_log = tokio::fs::read_to_string(engine_log)
            .await
            .ok()
            .filter(|s| !s.trim().is_empty());

        ExitReport {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            engine_log,
        }
    }

    /// Ask the engine to exit, then kill it after `grace`
    async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("Engine {:?} already exited: {}", self.pid, status);
            self.set_state(HandleState::Dead);
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!("Engine {:?} exited with status: {}", self.pid, status),
            Ok(Err(e)) => warn!("Error waiting for engine {:?}: {}", self.pid, e),
            Err(_) => {
                warn!("Engine {:?} didn't exit gracefully, forcing kill", self.pid);
                let _ = self.child.kill().await;
            }
        }
        self.set_state(HandleState::Dead);
    }

    fn remove_config(&self) {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => debug!("Removed engine config {}", self.config_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove engine config {}: {}",
                self.config_path.display(),
                e
            ),
        }
    }
}

impl Drop for TunnelProcessHandle {
    fn drop(&mut self) {
        // The child itself is killed on drop (kill_on_drop)
        self.remove_config();
    }
}

impl std::fmt::Debug for TunnelProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelProcessHandle")
            .field("pid", &self.pid)
            .field("config_path", &self.config_path)
            .field("state", &self.state)
            .finish()
    }
}

/// Supervisor timing and naming
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Engine executable stem, used by the stray sweep and temp file names
    pub engine_name: String,
    /// Engine error log, read back when a process dies
    pub engine_log: PathBuf,
    pub settle_delay: Duration,
    pub stop_timeout: Duration,
    pub sweep_delay: Duration,
}

impl SupervisorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        SupervisorConfig {
            engine_name: settings.engine_name.clone(),
            engine_log: settings.engine_log_path(),
            settle_delay: settings.settle_delay(),
            stop_timeout: settings.stop_timeout(),
            sweep_delay: settings.sweep_delay(),
        }
    }
}

/// Runs the engine as a child process
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    binary: BinaryManager,
    last_config: Mutex<Option<PathBuf>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, binary: BinaryManager) -> Self {
        ProcessSupervisor {
            config,
            binary,
            last_config: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            SupervisorConfig::from_settings(settings),
            BinaryManager::from_settings(settings),
        )
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Write `config` to a fresh temp file, deleting the previous attempt's
    async fn write_config(&self, config: &TunnelConfig) -> Result<PathBuf, StartError> {
        let previous = self.last_config.lock().take();
        if let Some(previous) = previous {
            if std::fs::remove_file(&previous).is_ok() {
                debug!("Removed previous engine config {}", previous.display());
            }
        }

        let json = config
            .to_json()
            .map_err(|e| StartError::launch(format!("failed to serialize config: {}", e)))?;

        let (_, path) = tempfile::Builder::new()
            .prefix(&format!("{}_", self.config.engine_name))
            .suffix(".json")
            .tempfile()
            .and_then(|file| file.keep().map_err(|e| e.error))
            .map_err(|e| StartError::launch(format!("failed to create config file: {}", e)))?;

        if let Err(e) = tokio::fs::write(&path, json).await {
            let _ = std::fs::remove_file(&path);
            return Err(StartError::launch(format!(
                "failed to write config {}: {}",
                path.display(),
                e
            )));
        }

        *self.last_config.lock() = Some(path.clone());
        Ok(path)
    }
}

#[async_trait]
impl EngineSupervisor for ProcessSupervisor {
    type Handle = TunnelProcessHandle;

    async fn ensure_binary(&self) -> Result<PathBuf, BinaryError> {
        self.binary.ensure().await
    }

    async fn start(
        &self,
        binary: &Path,
        config: &TunnelConfig,
    ) -> Result<TunnelProcessHandle, StartError> {
        let killed = sweep::sweep(&self.config.engine_name).await;
        if killed > 0 {
            info!("Killed {} stray engine process(es)", killed);
            sleep(self.config.sweep_delay).await;
        }

        let config_path = self.write_config(config).await?;

        // Stale log lines would be blamed on this attempt
        let _ = tokio::fs::remove_file(&self.config.engine_log).await;

        let mut cmd = Command::new(binary);
        cmd.arg("run")
            .arg("-config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        info!(
            "Starting engine: {} run -config {}",
            binary.display(),
            config_path.display()
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&config_path);
                return Err(StartError::launch(format!(
                    "{}: {}",
                    binary.display(),
                    e
                )));
            }
        };

        let pid = child.id();
        debug!("Engine started with PID: {:?}", pid);

        let capture = Arc::new(Mutex::new(OutputCapture {
            active: true,
            ..Default::default()
        }));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, capture.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, capture.clone(), true));
        }

        let handle = TunnelProcessHandle {
            child,
            pid,
            config_path,
            state: HandleState::Starting,
            capture,
            readers,
        };

        sleep(self.config.settle_delay).await;
        Ok(handle)
    }

    async fn probe(&self, handle: &mut TunnelProcessHandle) -> Liveness {
        let status = match handle.child.try_wait() {
            Ok(None) => {
                if handle.state == HandleState::Starting {
                    handle.release_capture();
                }
                handle.set_state(HandleState::Live);
                return Liveness::Live;
            }
            Ok(Some(status)) => Some(status),
            Err(e) => {
                warn!("Failed to query engine {:?}: {}", handle.pid, e);
                None
            }
        };

        handle.set_state(HandleState::Dead);
        let report = handle.collect_report(status, &self.config.engine_log).await;
        Liveness::Dead(report)
    }

    async fn stop(&self, mut handle: TunnelProcessHandle) {
        if handle.state != HandleState::Dead {
            info!("Stopping engine {:?}...", handle.pid);
        }
        handle.terminate(self.config.stop_timeout).await;
        handle.remove_config();

        let mut last = self.last_config.lock();
        if last.as_deref() == Some(handle.config_path()) {
            *last = None;
        }
    }
}

/// Forward engine output to the log and into `capture` while it is active
fn spawn_reader<R>(stream: R, capture: Arc<Mutex<OutputCapture>>, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(target: "engine", "output stream closed: {}", e);
                    break;
                }
            }
            // Engines may print non-UTF-8 bytes; keep draining past them
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            debug!(target: "engine", "{}", line);
            let mut guard = capture.lock();
            if guard.active {
                let buf = if is_stderr {
                    &mut guard.stderr
                } else {
                    &mut guard.stdout
                };
                buf.push_str(line);
                buf.push('\n');
            }
        }
    })
}
