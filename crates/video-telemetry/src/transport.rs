//! Network delivery of serialized event chunks.
//!
//! The client performs timeout-bounded POSTs to the intake endpoint and
//! classifies every outcome as success, retryable, or terminal. It never
//! retries on its own: retry policy lives with the harvest scheduler, which
//! routes retryable chunks into the retry store. On top of plain delivery it
//! adds content-hash deduplication over a trailing window, a cap on requests
//! in flight, and a rolling one-minute rate limit that queues rather than
//! drops.

use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use std::sync::Mutex;

use fnv::FnvHasher;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::{TelemetryConfig, TransportConfig};
use crate::error::TelemetryError;
use crate::retry::FailureKind;

/// Delivery mode for a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Timeout-bounded request on the regular harvest path.
    Normal,
    /// Best-effort teardown delivery: short timeout, skips the rate-limit
    /// queue, never blocks teardown beyond its own small timeout.
    Final,
}

/// Classified result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// HTTP status. `None` when no response was observed: network failure or
    /// timeout (status 0) on the failure side, a dedup skip on the success
    /// side.
    pub status: Option<u16>,
    pub retryable: bool,
    /// Skipped the network because an identical payload succeeded recently.
    pub deduplicated: bool,
    success: bool,
}

impl SendOutcome {
    pub fn success(&self) -> bool {
        self.success
    }

    /// Failure classification for the retry store.
    pub fn failure_kind(&self) -> FailureKind {
        match self.status {
            Some(status) => FailureKind::HttpStatus(status),
            None => FailureKind::Network,
        }
    }

    fn succeeded(status: Option<u16>, deduplicated: bool) -> Self {
        SendOutcome {
            status,
            retryable: false,
            deduplicated,
            success: true,
        }
    }

    fn failed(status: Option<u16>, retryable: bool) -> Self {
        SendOutcome {
            status,
            retryable,
            deduplicated: false,
            success: false,
        }
    }
}

/// Statuses that indicate a transient condition worth retrying.
///
/// Status 0 (network failure / timeout) is handled separately as `None`.
/// The 512-530 range is opt-in for deployments whose edge proxies use it.
pub(crate) fn is_retryable_status(status: u16, extended_range: bool) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
        || (extended_range && (512..=530).contains(&status))
}

/// Rolling one-minute send counter. Requests beyond the ceiling wait until
/// the oldest send slides out of the window; nothing is dropped here.
#[derive(Debug)]
struct RateWindow {
    sent: VecDeque<Instant>,
    ceiling: usize,
    window: Duration,
}

impl RateWindow {
    fn new(ceiling: usize) -> Self {
        RateWindow {
            sent: VecDeque::new(),
            ceiling,
            window: Duration::from_secs(60),
        }
    }

    /// Records a send now, or returns when the next slot opens.
    fn try_reserve(&mut self, now: Instant) -> Option<Instant> {
        while let Some(front) = self.sent.front() {
            if now.duration_since(*front) >= self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() < self.ceiling {
            self.sent.push_back(now);
            None
        } else {
            self.sent.front().map(|front| *front + self.window)
        }
    }
}

/// Transmission client for the intake endpoint.
pub struct TransportClient {
    client: reqwest::Client,
    intake_url: String,
    config: TransportConfig,
    in_flight: Semaphore,
    rate: Mutex<RateWindow>,
    /// Payload hash -> completion time of the last successful send.
    recent_hashes: Mutex<HashMap<u64, Instant>>,
}

impl TransportClient {
    pub fn new(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let client = reqwest::Client::builder().build()?;
        Ok(TransportClient {
            client,
            intake_url: config.intake_url(),
            config: config.transport,
            in_flight: Semaphore::new(config.transport.max_in_flight),
            rate: Mutex::new(RateWindow::new(config.transport.max_requests_per_minute)),
            recent_hashes: Mutex::new(HashMap::new()),
        })
    }

    /// Delivers one serialized chunk and classifies the outcome.
    pub async fn send(&self, payload: &[u8], mode: TransportMode) -> SendOutcome {
        let hash = payload_hash(payload);
        if self.config.dedup_enabled && self.recently_sent(hash) {
            debug!(hash, "Identical payload sent recently, skipping network call");
            return SendOutcome::succeeded(None, true);
        }

        if mode == TransportMode::Normal {
            self.wait_for_rate_slot().await;
        }

        // Closed only if the semaphore were closed, which never happens; a
        // failed acquire just forgoes the concurrency cap for this send.
        let _permit = self.in_flight.acquire().await.ok();

        let timeout = match mode {
            TransportMode::Normal => self.config.request_timeout,
            TransportMode::Final => self.config.final_timeout,
        };

        let response = self
            .client
            .post(&self.intake_url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(payload.to_vec())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    if self.config.dedup_enabled {
                        self.record_success(hash);
                    }
                    SendOutcome::succeeded(Some(status), false)
                } else if is_retryable_status(status, self.config.extended_retryable_range) {
                    warn!(status, "Intake returned retryable status");
                    SendOutcome::failed(Some(status), true)
                } else {
                    error!(status, "Intake returned terminal status, chunk will be dropped");
                    SendOutcome::failed(Some(status), false)
                }
            }
            Err(e) => {
                // Timeouts and connection failures classify as status 0.
                warn!(error = %e, "Network failure delivering chunk");
                SendOutcome::failed(None, true)
            }
        }
    }

    fn recently_sent(&self, hash: u64) -> bool {
        let Ok(mut recent) = self.recent_hashes.lock() else {
            return false;
        };
        let now = Instant::now();
        let window = self.config.dedup_window;
        recent.retain(|_, sent_at| now.duration_since(*sent_at) < window);
        recent.contains_key(&hash)
    }

    fn record_success(&self, hash: u64) {
        if let Ok(mut recent) = self.recent_hashes.lock() {
            recent.insert(hash, Instant::now());
        }
    }

    async fn wait_for_rate_slot(&self) {
        loop {
            let next_slot = match self.rate.lock() {
                Ok(mut rate) => rate.try_reserve(Instant::now()),
                // A poisoned rate window only disables the ceiling.
                Err(_) => None,
            };
            match next_slot {
                None => return,
                Some(at) => {
                    debug!("Per-minute request ceiling reached, waiting for a slot");
                    sleep_until(at).await;
                }
            }
        }
    }
}

fn payload_hash(payload: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(payload);
    hasher.finish()
}
