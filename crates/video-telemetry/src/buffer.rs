//! Bounded, ordered holding area for not-yet-sent events.
//!
//! The buffer enforces a dual limit (event count and summed serialized size)
//! with FIFO eviction on overflow, keeps both running totals incrementally in
//! sync on every mutation, and applies a singleton-merge rule for the
//! reserved aggregate event. After each insert it reports whether the fill
//! level crossed the advisory (smart) or urgent (overflow) harvest threshold.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::BufferConfig;
use crate::event::TelemetryEvent;

/// An event queued for delivery, bundled with its serialized size.
///
/// The size is computed once at insertion and reused for every later budget
/// decision (buffer accounting, chunking, retry eligibility).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: TelemetryEvent,
    pub size: usize,
}

/// Fill-threshold trigger fired after an insert.
///
/// Exactly one trigger fires per insert, with `Overflow` taking priority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HarvestTrigger {
    /// Buffer is at or above the urgent threshold; harvest immediately.
    Overflow { fill_percent: f64 },
    /// Buffer is at or above the advisory threshold; harvest soon.
    Smart { fill_percent: f64 },
}

/// How an insert was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended to the back of the queue.
    Queued,
    /// Replaced the existing aggregate event in place.
    Replaced,
    /// Rejected: the event alone exceeds the payload limit.
    Rejected,
}

/// Result of an insert: resolution, evictions it forced, and any trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InsertResult {
    pub outcome: InsertOutcome,
    /// Events evicted (oldest first) to make room for this insert.
    pub evicted: usize,
    pub trigger: Option<HarvestTrigger>,
}

/// Bounded FIFO event buffer with incremental size accounting.
#[derive(Debug)]
pub struct EventBuffer {
    queue: VecDeque<QueuedEvent>,
    config: BufferConfig,
    payload_size_bytes: usize,
    next_sequence: u64,
    dropped_events: u64,
}

impl EventBuffer {
    pub fn new(config: BufferConfig) -> Self {
        EventBuffer {
            queue: VecDeque::new(),
            config,
            payload_size_bytes: 0,
            next_sequence: 0,
            dropped_events: 0,
        }
    }

    /// Inserts an event, assigning its sequence number.
    ///
    /// Evicts oldest events until both the count and byte bounds hold. An
    /// event whose own serialized size exceeds the payload limit is rejected
    /// outright rather than evicting the whole queue for nothing. A second
    /// aggregate event replaces the queued one in place, preserving its
    /// position, adjusting the size total by the delta, and evicting oldest
    /// events if the replacement grew past the byte bound.
    pub fn insert(&mut self, mut event: TelemetryEvent) -> InsertResult {
        event.sequence = self.next_sequence;
        self.next_sequence += 1;
        let size = event.serialized_size();

        if size > self.config.max_payload_bytes {
            error!(
                size,
                limit = self.config.max_payload_bytes,
                action = %event.action_name,
                "Event exceeds the maximum payload size on its own, rejecting"
            );
            return InsertResult {
                outcome: InsertOutcome::Rejected,
                evicted: 0,
                trigger: None,
            };
        }

        if event.is_aggregate() {
            if let Some(position) = self.queue.iter().position(|q| q.event.is_aggregate()) {
                let previous_size = self.queue[position].size;
                self.payload_size_bytes = self.payload_size_bytes - previous_size + size;
                self.queue[position] = QueuedEvent { event, size };

                // A growing replacement can push the total past the byte
                // bound; evict oldest non-aggregate events until it holds.
                let mut evicted = 0;
                while self.payload_size_bytes > self.config.max_payload_bytes {
                    let Some(victim) = self.queue.iter().position(|q| !q.event.is_aggregate())
                    else {
                        break;
                    };
                    if let Some(oldest) = self.queue.remove(victim) {
                        self.payload_size_bytes -= oldest.size;
                        self.dropped_events += 1;
                        evicted += 1;
                        warn!(
                            action = %oldest.event.action_name,
                            sequence = oldest.event.sequence,
                            "Event buffer full, dropping oldest event"
                        );
                    }
                }
                return InsertResult {
                    outcome: InsertOutcome::Replaced,
                    evicted,
                    trigger: self.trigger(),
                };
            }
        }

        let mut evicted = 0;
        while self.queue.len() + 1 > self.config.max_events
            || self.payload_size_bytes + size > self.config.max_payload_bytes
        {
            match self.queue.pop_front() {
                Some(oldest) => {
                    self.payload_size_bytes -= oldest.size;
                    self.dropped_events += 1;
                    evicted += 1;
                    warn!(
                        action = %oldest.event.action_name,
                        sequence = oldest.event.sequence,
                        "Event buffer full, dropping oldest event"
                    );
                }
                None => break,
            }
        }

        self.payload_size_bytes += size;
        self.queue.push_back(QueuedEvent { event, size });

        InsertResult {
            outcome: InsertOutcome::Queued,
            evicted,
            trigger: self.trigger(),
        }
    }

    /// Atomically removes and returns the entire buffer in insertion order,
    /// resetting both running totals.
    pub fn drain(&mut self) -> Vec<QueuedEvent> {
        self.payload_size_bytes = 0;
        self.queue.drain(..).collect()
    }

    pub fn size_bytes(&self) -> usize {
        self.payload_size_bytes
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total events evicted for space over the buffer's lifetime.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Computes the post-insert fill trigger, overflow before smart.
    fn trigger(&self) -> Option<HarvestTrigger> {
        let payload_fraction = self.payload_size_bytes as f64 / self.config.max_payload_bytes as f64;
        let count_fraction = self.queue.len() as f64 / self.config.max_events as f64;
        let fill = payload_fraction.max(count_fraction);

        if fill >= self.config.overflow_threshold {
            Some(HarvestTrigger::Overflow {
                fill_percent: fill * 100.0,
            })
        } else if fill >= self.config.smart_threshold {
            Some(HarvestTrigger::Smart {
                fill_percent: fill * 100.0,
            })
        } else {
            None
        }
    }
}
