//! Bounded retry/dead-letter store for events that failed transmission.
//!
//! Each failed event is wrapped with its own retry budget and an exponential
//! backoff schedule with symmetric jitter. Items leave the store on eventual
//! success, on exhausting their retries, or on oldest-first eviction when the
//! store is full. Retry granularity is individual events, which keeps the
//! byte/count accounting exact when items are folded back into a harvest.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::buffer::QueuedEvent;
use crate::config::RetryConfig;
use crate::event::{unix_millis, TelemetryEvent};

/// Classification of the failure that put an item in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Network-level failure or request timeout (status 0).
    Network,
    /// Retryable HTTP status from the intake endpoint.
    HttpStatus(u16),
    /// Deferred at teardown because the final-harvest budget was exceeded.
    TeardownDeferred,
}

/// A failed event awaiting its next delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryItem {
    pub event: TelemetryEvent,
    pub size: usize,
    pub retry_count: u32,
    /// Wall-clock time of the first failure, ms since the Unix epoch.
    pub first_failure_ms: i64,
    pub last_error: FailureKind,
    /// When the next attempt becomes due, ms since the Unix epoch.
    pub next_attempt_ms: i64,
}

/// Serializable snapshot of the store for the optional persistence slot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetrySnapshot {
    pub items: Vec<RetryItem>,
}

/// Small xorshift generator for backoff jitter.
///
/// Jitter only needs to decorrelate retry timers, so a seeded xorshift is
/// enough and avoids carrying a full RNG dependency.
#[derive(Debug)]
struct JitterSource(u64);

impl JitterSource {
    fn seeded() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0x9e37_79b9, |d| d.as_nanos() as u64);
        JitterSource(seed | 1)
    }

    /// Next value uniformly in [0, 1).
    fn next_unit(&mut self) -> f64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// Bounded store of failed events with per-item backoff scheduling.
#[derive(Debug)]
pub struct RetryStore {
    items: VecDeque<RetryItem>,
    config: RetryConfig,
    jitter: JitterSource,
    discarded: u64,
    exhausted: u64,
}

impl RetryStore {
    pub fn new(config: RetryConfig) -> Self {
        RetryStore {
            items: VecDeque::new(),
            config,
            jitter: JitterSource::seeded(),
            discarded: 0,
            exhausted: 0,
        }
    }

    /// Wraps freshly failed events as retry items with a zero retry count and
    /// schedules their first attempt. Evicts oldest items when full.
    pub fn add_failed(&mut self, events: Vec<QueuedEvent>, error: FailureKind) {
        let now = unix_millis();
        for queued in events {
            self.evict_for_space();
            let delay = self.backoff_delay(0);
            self.items.push_back(RetryItem {
                event: queued.event,
                size: queued.size,
                retry_count: 0,
                first_failure_ms: now,
                last_error: error,
                next_attempt_ms: now + delay.as_millis() as i64,
            });
        }
    }

    /// Re-submits items whose in-flight attempt failed again.
    ///
    /// Increments each retry count; items at their budget are discarded
    /// permanently (counted as exhausted), the rest are rescheduled.
    pub fn reschedule_failed(&mut self, items: Vec<RetryItem>, error: FailureKind) {
        let now = unix_millis();
        for mut item in items {
            item.retry_count += 1;
            item.last_error = error;
            if item.retry_count >= self.config.max_retries {
                self.exhausted += 1;
                warn!(
                    action = %item.event.action_name,
                    sequence = item.event.sequence,
                    retries = item.retry_count,
                    "Retries exhausted, discarding event permanently"
                );
                continue;
            }
            self.evict_for_space();
            let delay = self.backoff_delay(item.retry_count);
            item.next_attempt_ms = now + delay.as_millis() as i64;
            self.items.push_back(item);
        }
    }

    /// Removes and returns every item whose retry timer has fired.
    pub fn take_due(&mut self, now_ms: i64) -> Vec<RetryItem> {
        let mut due = Vec::new();
        let mut keep = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if item.next_attempt_ms <= now_ms {
                due.push(item);
            } else {
                keep.push_back(item);
            }
        }
        self.items = keep;
        due
    }

    /// Oldest-first items that fit the given byte/count budget, removed from
    /// the store. They are owned by the in-flight harvest from here on; a
    /// failed attempt must hand them back via [`RetryStore::reschedule_failed`].
    pub fn take_eligible(&mut self, available_bytes: usize, available_count: usize) -> Vec<RetryItem> {
        let mut taken = Vec::new();
        let mut bytes = 0;
        while taken.len() < available_count {
            match self.items.front() {
                Some(item) if bytes + item.size <= available_bytes => {
                    bytes += item.size;
                    // Front was just checked, pop cannot fail.
                    if let Some(item) = self.items.pop_front() {
                        taken.push(item);
                    }
                }
                _ => break,
            }
        }
        if !taken.is_empty() {
            debug!(count = taken.len(), bytes, "Folding retry items into harvest");
        }
        taken
    }

    /// Time until the earliest retry timer fires, if any item is queued.
    pub fn next_due_in(&self, now_ms: i64) -> Option<Duration> {
        self.items
            .iter()
            .map(|item| item.next_attempt_ms)
            .min()
            .map(|due| Duration::from_millis(due.saturating_sub(now_ms).max(0) as u64))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items evicted for space over the store's lifetime.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Items permanently dropped after exhausting their retry budget.
    pub fn exhausted(&self) -> u64 {
        self.exhausted
    }

    /// Zeroes the discard counters without touching queued items, so a
    /// metrics reset covers the whole surface.
    pub fn reset_counters(&mut self) {
        self.discarded = 0;
        self.exhausted = 0;
    }

    /// Snapshot of the current contents for the persistence slot.
    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            items: self.items.iter().cloned().collect(),
        }
    }

    /// Restores a persisted snapshot, re-arming timers for items that are
    /// already past due and dropping any that exhausted their budget.
    pub fn restore(&mut self, snapshot: RetrySnapshot) {
        let now = unix_millis();
        for mut item in snapshot.items {
            if item.retry_count >= self.config.max_retries {
                self.exhausted += 1;
                continue;
            }
            if item.next_attempt_ms < now {
                let delay = self.backoff_delay(item.retry_count);
                item.next_attempt_ms = now + delay.as_millis() as i64;
            }
            self.evict_for_space();
            self.items.push_back(item);
        }
    }

    /// Exponential backoff with symmetric jitter.
    ///
    /// `min(initial * multiplier^retry_count, max_delay)`, then
    /// `delay * 0.25 * (random in [-0.5, 0.5])` of jitter, floor-clamped to
    /// the initial delay.
    pub fn backoff_delay(&mut self, retry_count: u32) -> Duration {
        let initial = self.config.initial_delay.as_millis() as f64;
        let raw = initial * self.config.backoff_multiplier.powi(retry_count as i32);
        let capped = raw.min(self.config.max_delay.as_millis() as f64);
        let jitter = capped * 0.25 * (self.jitter.next_unit() - 0.5);
        let delayed = (capped + jitter).max(initial);
        Duration::from_millis(delayed as u64)
    }

    fn evict_for_space(&mut self) {
        while self.items.len() >= self.config.max_items {
            if let Some(evicted) = self.items.pop_front() {
                self.discarded += 1;
                warn!(
                    action = %evicted.event.action_name,
                    retries = evicted.retry_count,
                    "Retry store full, discarding oldest item"
                );
            }
        }
    }
}
