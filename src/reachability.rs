use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::time;
use tracing::{debug, warn};

pub const DEFAULT_PROBE_TARGET: &str = "8.8.8.8:53";
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    Checking,
    Online,
    Offline,
}

impl ConnectivityStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Checking => "Checking...",
            Self::Online => "Online",
            Self::Offline => "Offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Amber,
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReachabilityState {
    pub status: ConnectivityStatus,
    pub latency_ms: u32,
    pub color_hint: StatusColor,
}

impl Default for ReachabilityState {
    fn default() -> Self {
        Self {
            status: ConnectivityStatus::Checking,
            latency_ms: 0,
            color_hint: StatusColor::Amber,
        }
    }
}

impl ReachabilityState {
    pub fn online(rtt: Duration) -> Self {
        Self {
            status: ConnectivityStatus::Online,
            latency_ms: u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX),
            color_hint: StatusColor::Green,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: ConnectivityStatus::Offline,
            latency_ms: 0,
            color_hint: StatusColor::Red,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),
    #[error("probe transport error: {0}")]
    Transport(String),
    #[error("probe target answered with status {0}")]
    Reply(u16),
}

#[async_trait]
pub trait Prober: Send + Sync {
    fn target(&self) -> &str;

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError>;
}

pub struct TcpProber {
    target: String,
}

impl TcpProber {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    fn target(&self) -> &str {
        &self.target
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        match time::timeout(timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(err)) => Err(ProbeError::Transport(err.to_string())),
            Err(_elapsed) => Err(ProbeError::TimedOut(timeout)),
        }
    }
}

pub struct HttpProber {
    client: Client,
    url: String,
}

impl HttpProber {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    fn target(&self) -> &str {
        &self.url
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        match self.client.head(&self.url).timeout(timeout).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || status.is_redirection() {
                    Ok(start.elapsed())
                } else {
                    Err(ProbeError::Reply(status.as_u16()))
                }
            }
            Err(err) if err.is_timeout() => Err(ProbeError::TimedOut(timeout)),
            Err(err) => Err(ProbeError::Transport(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Completed(ReachabilityState),
    Busy,
}

pub struct ReachabilityMonitor {
    prober: Arc<dyn Prober>,
    timeout: Duration,
    gate: Semaphore,
    state: watch::Sender<ReachabilityState>,
    skipped: AtomicU64,
}

impl ReachabilityMonitor {
    pub fn new(prober: Arc<dyn Prober>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(ReachabilityState::default());
        Self {
            prober,
            timeout,
            gate: Semaphore::new(1),
            state,
            skipped: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> ReachabilityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReachabilityState> {
        self.state.subscribe()
    }

    pub fn skipped_probes(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub async fn probe(&self) -> ProbeOutcome {
        let Ok(_permit) = self.gate.try_acquire() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(probe_target = %self.prober.target(), "probe already in flight, skipping");
            return ProbeOutcome::Busy;
        };

        let next = match self.prober.probe(self.timeout).await {
            Ok(rtt) => ReachabilityState::online(rtt),
            Err(err) => {
                debug!(
                    probe_target = %self.prober.target(),
                    error = %err,
                    "reachability probe failed"
                );
                ReachabilityState::offline()
            }
        };
        self.state.send_replace(next);
        ProbeOutcome::Completed(next)
    }

    pub fn spawn_probe(self: &Arc<Self>) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!("no async runtime available, reachability probe not started");
            return false;
        };
        let monitor = Arc::clone(self);
        handle.spawn(async move {
            monitor.probe().await;
        });
        true
    }
}
