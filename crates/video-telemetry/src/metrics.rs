//! Pipeline metrics: the only failure-visibility channel producers get.
//!
//! All counters accumulate monotonically until reset; gauges reflect the
//! moment the snapshot was taken. Mutation happens exclusively on the
//! scheduler task, so plain integers are enough.

use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of the pipeline counters and gauges.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub events_added: u64,
    pub events_dropped: u64,
    pub events_drained: u64,
    pub events_rejected: u64,
    pub harvests_attempted: u64,
    pub harvests_succeeded: u64,
    pub harvests_failed: u64,
    pub avg_harvest_duration_ms: u64,
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_deduplicated: u64,
    pub retry_items_discarded: u64,
    pub retry_items_exhausted: u64,
    /// Gauge: events currently buffered.
    pub buffer_events: u64,
    /// Gauge: serialized bytes currently buffered.
    pub buffer_bytes: u64,
    /// Gauge: items currently in the retry store.
    pub retry_items: u64,
}

/// Accumulating counters owned by the harvest scheduler.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub events_added: u64,
    pub events_dropped: u64,
    pub events_drained: u64,
    pub events_rejected: u64,
    pub harvests_attempted: u64,
    pub harvests_succeeded: u64,
    pub harvests_failed: u64,
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub requests_deduplicated: u64,
    harvest_duration_total: Duration,
    harvests_timed: u64,
}

impl PipelineMetrics {
    pub fn record_harvest(&mut self, duration: Duration, succeeded: bool) {
        self.harvests_attempted += 1;
        if succeeded {
            self.harvests_succeeded += 1;
        } else {
            self.harvests_failed += 1;
        }
        self.harvest_duration_total += duration;
        self.harvests_timed += 1;
    }

    pub fn snapshot(
        &self,
        buffer_events: usize,
        buffer_bytes: usize,
        retry_items: usize,
        retry_discarded: u64,
        retry_exhausted: u64,
    ) -> MetricsSnapshot {
        let avg_harvest_duration_ms = if self.harvests_timed == 0 {
            0
        } else {
            (self.harvest_duration_total.as_millis() / u128::from(self.harvests_timed)) as u64
        };
        MetricsSnapshot {
            events_added: self.events_added,
            events_dropped: self.events_dropped,
            events_drained: self.events_drained,
            events_rejected: self.events_rejected,
            harvests_attempted: self.harvests_attempted,
            harvests_succeeded: self.harvests_succeeded,
            harvests_failed: self.harvests_failed,
            avg_harvest_duration_ms,
            requests_sent: self.requests_sent,
            requests_succeeded: self.requests_succeeded,
            requests_failed: self.requests_failed,
            requests_deduplicated: self.requests_deduplicated,
            retry_items_discarded: retry_discarded,
            retry_items_exhausted: retry_exhausted,
            buffer_events: buffer_events as u64,
            buffer_bytes: buffer_bytes as u64,
            retry_items: retry_items as u64,
        }
    }

    pub fn reset(&mut self) {
        *self = PipelineMetrics::default();
    }
}
