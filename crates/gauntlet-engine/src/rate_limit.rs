use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use gauntlet_core::config::ProviderConfig;

/// Proof that a call to `provider` was admitted.
#[derive(Debug, Clone)]
pub struct AdmissionPermit {
    pub provider: String,
    pub admitted_at: Instant,
    /// Time spent waiting for a free slot.
    pub waited: Duration,
}

/// Sliding window of admission instants for one provider.
struct SlidingWindow {
    max_calls: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(max_calls: u32, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1) as usize,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an admission now if the window has room, otherwise return the
    /// instant the oldest admission ages out.
    async fn try_admit(&self) -> std::result::Result<Instant, Instant> {
        let mut admitted = self.admitted.lock().await;
        let now = Instant::now();
        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
        if admitted.len() < self.max_calls {
            admitted.push_back(now);
            return Ok(now);
        }
        match admitted.front() {
            Some(&oldest) => Err(oldest + self.window),
            None => Ok(now),
        }
    }
}

/// Per-provider admission control. Callers never see a denial, only latency.
#[derive(Default)]
pub struct RateLimiter {
    windows: HashMap<String, SlidingWindow>,
}

impl RateLimiter {
    /// A limiter with no quotas; every provider is admitted immediately.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Add a quota of `max_calls` per rolling `window` for `provider`.
    pub fn with_quota(mut self, provider: impl Into<String>, max_calls: u32, window: Duration) -> Self {
        self.windows
            .insert(provider.into(), SlidingWindow::new(max_calls, window));
        self
    }

    /// Build quotas from the `[providers.<id>.rate_limit]` sections.
    pub fn from_config(providers: &BTreeMap<String, ProviderConfig>) -> Self {
        providers
            .iter()
            .filter_map(|(id, p)| p.rate_limit.map(|rl| (id, rl)))
            .fold(Self::unlimited(), |limiter, (id, rl)| {
                limiter.with_quota(id.clone(), rl.max_calls, Duration::from_secs(rl.window_secs))
            })
    }

    pub fn is_limited(&self, provider: &str) -> bool {
        self.windows.contains_key(provider)
    }

    /// Wait until a call to `provider` fits in its window, then record it.
    pub async fn admit(&self, provider: &str) -> AdmissionPermit {
        let started = Instant::now();
        let Some(window) = self.windows.get(provider) else {
            return AdmissionPermit {
                provider: provider.to_string(),
                admitted_at: started,
                waited: Duration::ZERO,
            };
        };

        loop {
            match window.try_admit().await {
                Ok(admitted_at) => {
                    let waited = admitted_at.duration_since(started);
                    if !waited.is_zero() {
                        debug!(provider, waited_ms = waited.as_millis() as u64, "Rate limit admission after wait");
                    }
                    return AdmissionPermit {
                        provider: provider.to_string(),
                        admitted_at,
                        waited,
                    };
                }
                Err(retry_at) => {
                    debug!(provider, "Rate limit window full, waiting");
                    tokio::time::sleep_until(retry_at).await;
                }
            }
        }
    }
}
