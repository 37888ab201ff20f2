//! Tunnel manager
//!
//! Turns "give me a proxy" into a running engine:
//!
//! ```text
//! Idle -> Acquiring -> Trying(0) -> Trying(1) -> ... -> Live
//!                                                  \-> ExhaustedNoProxy
//! ```
//!
//! At most one engine handle is held at a time. The slot lock also
//! serialises acquisition, so concurrent callers wait for the first
//! caller's result instead of launching their own engine.

use crate::common::StartError;
use crate::config::{Settings, TunnelConfigBuilder};
use crate::outbound::decode;
use crate::provider::{CandidateSource, SubscriptionFetcher};
use crate::supervisor::{EngineSupervisor, Liveness, ProcessSupervisor};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Manager state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Nothing running, nothing attempted (or shut down)
    Idle,
    /// Locating the binary and fetching candidates
    Acquiring,
    /// Trying the candidate at this index
    Trying(usize),
    /// An engine is up
    Live,
    /// Last acquisition found nothing usable
    ExhaustedNoProxy,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Idle => write!(f, "idle"),
            ManagerState::Acquiring => write!(f, "acquiring"),
            ManagerState::Trying(i) => write!(f, "trying #{}", i + 1),
            ManagerState::Live => write!(f, "live"),
            ManagerState::ExhaustedNoProxy => write!(f, "exhausted"),
        }
    }
}

/// Local proxy address handed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl ProxyEndpoint {
    pub const SCHEME: &'static str = "socks5";

    pub fn new(host: IpAddr, port: u16) -> Self {
        ProxyEndpoint { host, port }
    }

    /// Loopback endpoint on `port`
    pub fn loopback(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn scheme(&self) -> &'static str {
        Self::SCHEME
    }

    /// `socks5://host:port`
    pub fn url(&self) -> String {
        match self.host {
            IpAddr::V6(v6) => format!("{}://[{}]:{}", Self::SCHEME, v6, self.port),
            IpAddr::V4(v4) => format!("{}://{}:{}", Self::SCHEME, v4, self.port),
        }
    }

    /// `{"http": url, "https": url}` for HTTP clients configured by scheme
    pub fn proxy_map(&self) -> HashMap<&'static str, String> {
        let url = self.url();
        HashMap::from([("http", url.clone()), ("https", url)])
    }

    /// Proxy for every request of a `reqwest` client
    pub fn to_reqwest_proxy(&self) -> reqwest::Result<reqwest::Proxy> {
        reqwest::Proxy::all(self.url())
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

/// Why one candidate was passed over
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    /// Position in the candidate list
    pub index: usize,
    pub error: StartError,
}

/// Finds, starts and keeps one working tunnel
pub struct TunnelManager<C, S: EngineSupervisor> {
    source: C,
    supervisor: S,
    builder: TunnelConfigBuilder,
    endpoint: ProxyEndpoint,
    max_candidates: usize,
    state: RwLock<ManagerState>,
    slot: Mutex<Option<S::Handle>>,
    failures: RwLock<Vec<CandidateFailure>>,
}

impl TunnelManager<SubscriptionFetcher, ProcessSupervisor> {
    /// Manager backed by the real subscription and engine process
    pub fn from_settings(settings: &Settings) -> Self {
        TunnelManager::new(
            SubscriptionFetcher::from_settings(settings),
            ProcessSupervisor::from_settings(settings),
            TunnelConfigBuilder::from_settings(settings),
            settings.max_candidates,
        )
    }
}

impl<C, S> TunnelManager<C, S>
where
    C: CandidateSource,
    S: EngineSupervisor,
{
    pub fn new(source: C, supervisor: S, builder: TunnelConfigBuilder, max_candidates: usize) -> Self {
        let host = builder
            .listen()
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let endpoint = ProxyEndpoint::new(host, builder.socks_port());

        TunnelManager {
            source,
            supervisor,
            builder,
            endpoint,
            max_candidates,
            state: RwLock::new(ManagerState::Idle),
            slot: Mutex::new(None),
            failures: RwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    /// Endpoint the engine listens on once live
    pub fn endpoint(&self) -> ProxyEndpoint {
        self.endpoint
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Candidates that failed during the last acquisition
    pub fn last_failures(&self) -> Vec<CandidateFailure> {
        self.failures.read().clone()
    }

    fn set_state(&self, new_state: ManagerState) {
        let mut state = self.state.write();
        if *state != new_state {
            debug!("Tunnel state: {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    /// Return a working proxy endpoint, or `None` when no candidate works.
    ///
    /// A live engine is reused without refetching. `None` is not remembered:
    /// the next call starts over.
    pub async fn get_proxy(&self) -> Option<ProxyEndpoint> {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = slot.as_mut() {
            match self.supervisor.probe(handle).await {
                Liveness::Live => return Some(self.endpoint),
                Liveness::Dead(report) => {
                    warn!("Tunnel engine died: {}", report.diagnostics());
                    if let Some(dead) = slot.take() {
                        self.supervisor.stop(dead).await;
                    }
                }
            }
        }

        self.set_state(ManagerState::Acquiring);
        match self.acquire().await {
            Some(handle) => {
                *slot = Some(handle);
                self.set_state(ManagerState::Live);
                Some(self.endpoint)
            }
            None => {
                self.set_state(ManagerState::ExhaustedNoProxy);
                None
            }
        }
    }

    async fn acquire(&self) -> Option<S::Handle> {
        self.failures.write().clear();

        let binary = match self.supervisor.ensure_binary().await {
            Ok(path) => path,
            Err(e) => {
                error!("Engine binary unavailable: {}", e);
                return None;
            }
        };

        let candidates = self.source.fetch_candidates().await;
        if candidates.is_empty() {
            warn!("No proxy candidates available");
            return None;
        }

        let total = candidates.len().min(self.max_candidates);
        for (index, link) in candidates.iter().take(self.max_candidates).enumerate() {
            self.set_state(ManagerState::Trying(index));

            let outbound = match decode(link) {
                Ok(outbound) => outbound,
                Err(e) => {
                    info!("Skipping candidate {}/{}: {}", index + 1, total, e);
                    continue;
                }
            };
            info!("Trying candidate {}/{}: {}", index + 1, total, outbound);

            let config = self.builder.build(&outbound);
            let mut handle = match self.supervisor.start(&binary, &config).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Candidate {}/{} failed: {}", index + 1, total, e);
                    self.failures.write().push(CandidateFailure { index, error: e });
                    continue;
                }
            };

            match self.supervisor.probe(&mut handle).await {
                Liveness::Live => {
                    info!("Tunnel up via {} on {}", outbound, self.endpoint);
                    return Some(handle);
                }
                Liveness::Dead(report) => {
                    warn!(
                        "Candidate {}/{} failed: {}",
                        index + 1,
                        total,
                        report.diagnostics()
                    );
                    self.failures.write().push(CandidateFailure {
                        index,
                        error: StartError::ProbeFailedDead(report),
                    });
                    self.supervisor.stop(handle).await;
                }
            }
        }

        warn!("All {} candidate(s) failed, continuing without proxy", total);
        None
    }

    /// Stop the engine if one is running. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let handle = self.slot.lock().await.take();
        if let Some(handle) = handle {
            self.supervisor.stop(handle).await;
            info!("Tunnel shut down");
        }
        self.set_state(ManagerState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BinaryError;
    use crate::config::TunnelConfig;
    use crate::supervisor::ExitReport;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct StaticSource {
        links: Vec<String>,
        fetches: Arc<AtomicUsize>,
    }

    impl StaticSource {
        fn new(links: &[&str]) -> Self {
            StaticSource {
                links: links.iter().map(|s| s.to_string()).collect(),
                fetches: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl CandidateSource for StaticSource {
        async fn fetch_candidates(&self) -> Vec<String> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.links.clone()
        }
    }

    #[derive(Debug)]
    struct FakeHandle {
        id: usize,
        alive: bool,
    }

    /// Engine whose launches succeed or die according to a script
    #[derive(Default)]
    struct FakeEngine {
        outcomes: parking_lot::Mutex<VecDeque<bool>>,
        binary_missing: bool,
        start_delay: Duration,
        starts: AtomicUsize,
        stops: AtomicUsize,
        configs: parking_lot::Mutex<Vec<TunnelConfig>>,
    }

    impl FakeEngine {
        fn with_outcomes(outcomes: &[bool]) -> Self {
            FakeEngine {
                outcomes: parking_lot::Mutex::new(outcomes.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EngineSupervisor for FakeEngine {
        type Handle = FakeHandle;

        async fn ensure_binary(&self) -> Result<PathBuf, BinaryError> {
            if self.binary_missing {
                Err(BinaryError::download("offline"))
            } else {
                Ok(PathBuf::from("/opt/xray"))
            }
        }

        async fn start(&self, _binary: &Path, config: &TunnelConfig) -> Result<FakeHandle, StartError> {
            tokio::time::sleep(self.start_delay).await;
            let id = self.starts.fetch_add(1, Ordering::SeqCst);
            self.configs.lock().push(config.clone());
            let alive = self.outcomes.lock().pop_front().unwrap_or(false);
            Ok(FakeHandle { id, alive })
        }

        async fn probe(&self, handle: &mut FakeHandle) -> Liveness {
            if handle.alive {
                Liveness::Live
            } else {
                Liveness::Dead(ExitReport {
                    exit_code: Some(1),
                    stderr: format!("engine {} failed to start", handle.id),
                    ..Default::default()
                })
            }
        }

        async fn stop(&self, _handle: FakeHandle) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new(
            "127.0.0.1".into(),
            10808,
            "warning".into(),
            PathBuf::from("/tmp/xray.log"),
        )
    }

    fn vmess_link() -> String {
        format!(
            "vmess://{}",
            STANDARD.encode(r#"{"add":"h2","port":8443,"id":"u2"}"#)
        )
    }

    const VLESS_TLS: &str = "vless://uuid@host:443?security=tls&sni=example.com";

    #[test]
    fn test_endpoint_forms() {
        let endpoint = ProxyEndpoint::loopback(10808);
        assert_eq!(endpoint.url(), "socks5://127.0.0.1:10808");
        assert_eq!(endpoint.scheme(), "socks5");
        let map = endpoint.proxy_map();
        assert_eq!(map["http"], "socks5://127.0.0.1:10808");
        assert_eq!(map["https"], "socks5://127.0.0.1:10808");
        assert!(endpoint.to_reqwest_proxy().is_ok());

        let v6 = ProxyEndpoint::new("::1".parse().unwrap(), 1080);
        assert_eq!(v6.to_string(), "socks5://[::1]:1080");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ManagerState::Trying(0).to_string(), "trying #1");
        assert_eq!(ManagerState::ExhaustedNoProxy.to_string(), "exhausted");
    }

    #[tokio::test]
    async fn test_first_live_candidate_wins() {
        let vmess = vmess_link();
        let manager = TunnelManager::new(
            StaticSource::new(&[VLESS_TLS, &vmess]),
            FakeEngine::with_outcomes(&[true, true]),
            builder(),
            10,
        );

        let endpoint = manager.get_proxy().await.unwrap();
        assert_eq!(endpoint, ProxyEndpoint::loopback(10808));
        assert_eq!(manager.state(), ManagerState::Live);
        assert_eq!(manager.supervisor().starts(), 1);

        let configs = manager.supervisor().configs.lock().clone();
        let stream = &configs[0].outbounds[0].stream_settings;
        assert_eq!(
            stream.tls_settings.as_ref().unwrap().server_name,
            "example.com"
        );
    }

    #[tokio::test]
    async fn test_live_handle_is_reused() {
        let source = StaticSource::new(&[VLESS_TLS]);
        let fetches = source.fetches.clone();
        let manager = TunnelManager::new(source, FakeEngine::with_outcomes(&[true]), builder(), 10);

        let first = manager.get_proxy().await;
        let second = manager.get_proxy().await;
        assert_eq!(first, second);
        assert!(first.is_some());
        assert_eq!(manager.supervisor().starts(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_candidates_dead() {
        let vmess = vmess_link();
        let manager = TunnelManager::new(
            StaticSource::new(&[VLESS_TLS, &vmess]),
            FakeEngine::with_outcomes(&[false, false]),
            builder(),
            10,
        );

        assert_eq!(manager.get_proxy().await, None);
        assert_eq!(manager.state(), ManagerState::ExhaustedNoProxy);
        assert_eq!(manager.supervisor().starts(), 2);
        assert_eq!(manager.supervisor().stops(), 2);

        let failures = manager.last_failures();
        assert_eq!(failures.len(), 2);
        match &failures[1].error {
            StartError::ProbeFailedDead(report) => {
                assert_eq!(report.stderr, "engine 1 failed to start")
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_candidates_are_skipped() {
        let manager = TunnelManager::new(
            StaticSource::new(&[
                "ss://YWVzLTI1Ni1nY206cGFzcw@h:8388",
                "trojan://pw@h:443",
                "vless://no-at-sign",
                "vless://u@good.example:443",
            ]),
            FakeEngine::with_outcomes(&[true]),
            builder(),
            10,
        );

        assert!(manager.get_proxy().await.is_some());
        assert_eq!(manager.supervisor().starts(), 1);
        let configs = manager.supervisor().configs.lock().clone();
        let json = configs[0].to_json().unwrap();
        assert!(json.contains("good.example"));
    }

    #[tokio::test]
    async fn test_candidate_cap() {
        let links: Vec<String> = (0..15).map(|i| format!("vless://u@h{}:443", i)).collect();
        let refs: Vec<&str> = links.iter().map(String::as_str).collect();
        let manager = TunnelManager::new(
            StaticSource::new(&refs),
            FakeEngine::with_outcomes(&[false; 15]),
            builder(),
            10,
        );

        assert_eq!(manager.get_proxy().await, None);
        assert_eq!(manager.supervisor().starts(), 10);
    }

    #[tokio::test]
    async fn test_missing_binary_means_no_proxy() {
        let source = StaticSource::new(&[VLESS_TLS]);
        let fetches = source.fetches.clone();
        let engine = FakeEngine {
            binary_missing: true,
            ..Default::default()
        };
        let manager = TunnelManager::new(source, engine, builder(), 10);

        assert_eq!(manager.get_proxy().await, None);
        assert_eq!(manager.state(), ManagerState::ExhaustedNoProxy);
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_subscription_means_no_proxy() {
        let manager = TunnelManager::new(StaticSource::new(&[]), FakeEngine::default(), builder(), 10);
        assert_eq!(manager.get_proxy().await, None);
        assert_eq!(manager.supervisor().starts(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_sticky() {
        let source = StaticSource::new(&[VLESS_TLS]);
        let fetches = source.fetches.clone();
        let manager = TunnelManager::new(source, FakeEngine::with_outcomes(&[false, true]), builder(), 10);

        assert_eq!(manager.get_proxy().await, None);
        assert!(manager.get_proxy().await.is_some());
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ManagerState::Live);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_start() {
        let engine = FakeEngine {
            start_delay: Duration::from_millis(50),
            ..FakeEngine::with_outcomes(&[true, true])
        };
        let manager = TunnelManager::new(StaticSource::new(&[VLESS_TLS]), engine, builder(), 10);

        let (a, b) = tokio::join!(manager.get_proxy(), manager.get_proxy());
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(manager.supervisor().starts(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let manager = TunnelManager::new(
            StaticSource::new(&[VLESS_TLS]),
            FakeEngine::with_outcomes(&[true]),
            builder(),
            10,
        );

        manager.shutdown().await;
        assert!(manager.get_proxy().await.is_some());
        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.supervisor().stops(), 1);
        assert_eq!(manager.state(), ManagerState::Idle);
    }
}
