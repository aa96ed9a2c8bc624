//! Network plumbing: the shared HTTP client, the per-service connectivity
//! gate, and the download backoff schedule.
//!
//! The gate is the single choke point for outbound HuggingFace traffic. It
//! tracks consecutive connect failures (three in a row take the service
//! offline for a minute, after which a single probe request decides
//! recovery) and the rate-limit blackout window. While the gate is closed,
//! callers fall back to cached data and the health surface reports
//! `offline_mode`.

pub mod source;

pub use source::{SourceCapability, WebSource};

use crate::config::NetworkConfig;
use crate::error::{LibraryError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Externally visible network health.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NetworkStatus {
    /// True when requests may go out right now
    pub online: bool,
    /// True when the service is offline and cached data is being served
    pub offline_mode: bool,
    /// `online`, `offline`, or `probing`
    pub circuit_state: String,
    /// Seconds left in a rate-limit blackout, if one is active
    pub blackout_remaining_secs: Option<u64>,
}

/// Tunables for the gate; defaults come from [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct GatePolicy {
    /// Consecutive connect/timeout failures that take the service offline
    pub failure_threshold: u32,
    /// How long the service stays offline before a probe is allowed
    pub offline_window: Duration,
    /// Minimum rate-limit blackout, regardless of Retry-After
    pub blackout_floor: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: NetworkConfig::CIRCUIT_FAILURE_THRESHOLD,
            offline_window: NetworkConfig::CIRCUIT_RECOVERY_TIMEOUT,
            blackout_floor: NetworkConfig::RATE_LIMIT_BLACKOUT,
        }
    }
}

/// Connectivity phase of the guarded service.
#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Healthy; requests flow
    Online,
    /// Too many consecutive failures; requests are refused until the
    /// offline window elapses
    Offline { since: Instant },
    /// One probe request is in flight; its outcome decides the phase
    Probing,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Online => "online",
            Phase::Offline { .. } => "offline",
            Phase::Probing => "probing",
        }
    }
}

#[derive(Debug)]
struct GateInner {
    phase: Phase,
    consecutive_connect_failures: u32,
    blackout_until: Option<Instant>,
}

/// Gate in front of all outbound requests for one service.
pub struct NetworkGate {
    service: String,
    domain: String,
    policy: GatePolicy,
    inner: Mutex<GateInner>,
}

impl NetworkGate {
    pub fn new(service: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::with_policy(service, domain, GatePolicy::default())
    }

    pub fn with_policy(
        service: impl Into<String>,
        domain: impl Into<String>,
        policy: GatePolicy,
    ) -> Self {
        Self {
            service: service.into(),
            domain: domain.into(),
            policy,
            inner: Mutex::new(GateInner {
                phase: Phase::Online,
                consecutive_connect_failures: 0,
                blackout_until: None,
            }),
        }
    }

    /// Admit or refuse an outbound request.
    ///
    /// An active blackout refuses with `RateLimited`; an offline service
    /// refuses with `CircuitOpen` until the offline window elapses, at which
    /// point exactly one caller is admitted as the recovery probe.
    pub fn ensure_allowed(&self) -> Result<()> {
        let mut inner = self.lock();

        if let Some(remaining) = blackout_remaining(&inner) {
            return Err(LibraryError::RateLimited {
                service: self.service.clone(),
                retry_after_secs: Some(remaining.as_secs().max(1)),
            });
        }

        match inner.phase {
            Phase::Online => Ok(()),
            Phase::Offline { since } if since.elapsed() >= self.policy.offline_window => {
                // This caller becomes the probe; everyone else keeps waiting.
                inner.phase = Phase::Probing;
                debug!("Probing {} after offline window", self.domain);
                Ok(())
            }
            Phase::Offline { .. } | Phase::Probing => Err(LibraryError::CircuitOpen {
                domain: self.domain.clone(),
            }),
        }
    }

    /// A request completed; failures reset and a probe brings the service
    /// back online.
    pub fn note_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_connect_failures = 0;
        if !matches!(inner.phase, Phase::Online) {
            info!("{} back online", self.service);
            inner.phase = Phase::Online;
        }
    }

    /// A connect/timeout failure; enough of them in a row, or one failed
    /// probe, take the service offline.
    pub fn note_connect_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_connect_failures += 1;
        match inner.phase {
            Phase::Probing => {
                debug!("Probe to {} failed; staying offline", self.domain);
                inner.phase = Phase::Offline {
                    since: Instant::now(),
                };
            }
            Phase::Online
                if inner.consecutive_connect_failures >= self.policy.failure_threshold =>
            {
                warn!(
                    "{} offline after {} consecutive connect failures",
                    self.service, inner.consecutive_connect_failures
                );
                inner.phase = Phase::Offline {
                    since: Instant::now(),
                };
            }
            _ => {}
        }
    }

    /// The service throttled us; refuse requests for at least the blackout
    /// floor. A larger Retry-After extends the window.
    pub fn note_rate_limit(&self, retry_after: Option<Duration>) {
        let window = retry_after
            .unwrap_or(self.policy.blackout_floor)
            .max(self.policy.blackout_floor);
        warn!("{} rate limited; refusing requests for {:?}", self.service, window);
        self.lock().blackout_until = Some(Instant::now() + window);
    }

    pub fn status(&self) -> NetworkStatus {
        let inner = self.lock();
        let blackout = blackout_remaining(&inner);
        let offline = !matches!(inner.phase, Phase::Online);
        NetworkStatus {
            online: !offline && blackout.is_none(),
            offline_mode: offline,
            circuit_state: inner.phase.name().to_string(),
            blackout_remaining_secs: blackout.map(|d| d.as_secs()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner.lock().expect("network gate poisoned")
    }
}

fn blackout_remaining(inner: &GateInner) -> Option<Duration> {
    let until = inner.blackout_until?;
    until.checked_duration_since(Instant::now())
}

/// Per-file download retry schedule: 2s, 4s, 8s (capped), consumed one
/// delay at a time by an explicit retry loop at the call site.
#[derive(Debug)]
pub struct BackoffSchedule {
    retries_left: u32,
    current_delay: Duration,
    cap: Duration,
    jitter: bool,
}

impl BackoffSchedule {
    /// The schedule used for download streams.
    pub fn download() -> Self {
        Self {
            retries_left: NetworkConfig::MAX_RETRIES,
            current_delay: NetworkConfig::RETRY_BASE_DELAY,
            cap: NetworkConfig::RETRY_MAX_DELAY,
            jitter: true,
        }
    }

    /// Jitter-free schedule for tests.
    pub fn fixed(retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            retries_left: retries,
            current_delay: base,
            cap,
            jitter: false,
        }
    }

    /// Take the next delay, doubling toward the cap. `None` once the retry
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;

        let delay = self.current_delay;
        self.current_delay = (self.current_delay * 2).min(self.cap);

        if self.jitter {
            // +/-25% spreads simultaneous retries without reordering the
            // schedule.
            use rand::Rng;
            let factor = rand::rng().random_range(0.75..=1.25);
            Some(delay.mul_f64(factor))
        } else {
            Some(delay)
        }
    }
}

/// Build the shared HTTP client with the library's connect policy.
///
/// Connection pooling (HTTP/2 where the server offers it) comes with the
/// client; in-flight streams carry no total timeout and rely on the gate
/// instead.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
        .user_agent(concat!("ocelot-library/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| LibraryError::Network {
            message: format!("Failed to build HTTP client: {}", e),
            cause: None,
        })
}

/// Classify a reqwest error as a connect-level failure for the gate.
pub fn is_connect_failure(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
