//! Harvest scheduling: the pipeline orchestrator.
//!
//! The scheduler owns the event buffer, the retry store, and the transmission
//! client, and runs as a single task driven by a command channel, a harvest
//! timer, retry timers, and a teardown cancellation token. Because every
//! mutation happens on this one task, buffer and store operations are atomic
//! with respect to the loop; network sends are the only suspension points and
//! an `is_harvesting` flag guards a cycle against re-entry across them.
//!
//! Producers talk to the scheduler through a [`HarvesterHandle`]; they are
//! fire-and-forget and never see delivery failures, which surface only in the
//! metrics snapshot.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::buffer::{EventBuffer, HarvestTrigger, InsertOutcome, QueuedEvent};
use crate::chunker::{chunk_events, ChunkBudget};
use crate::config::{HarvestConfig, TelemetryConfig};
use crate::error::TelemetryError;
use crate::event::{unix_millis, TelemetryEvent};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::persistence::{NoopSnapshotStore, RetrySnapshotStore};
use crate::retry::{FailureKind, RetryStore};
use crate::transport::{TransportClient, TransportMode};

/// How a triggered harvest cycle resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestOutcome {
    /// Nothing buffered and nothing eligible for retry; network untouched.
    NoEvents,
    /// A cycle was already in flight; this trigger was dropped.
    AlreadyHarvesting,
    /// The cycle ran; counts of how each chunk fared.
    Completed {
        chunks_sent: usize,
        chunks_retried: usize,
        chunks_dropped: usize,
    },
}

#[derive(Debug)]
pub enum HarvesterCommand {
    Insert(TelemetryEvent),
    ForceHarvest(oneshot::Sender<HarvestOutcome>),
    SetHarvestInterval(Duration),
    GetMetrics(oneshot::Sender<MetricsSnapshot>),
    ResetMetrics,
    Shutdown,
}

/// Producer-facing handle to the scheduler task. Cheap to clone.
#[derive(Clone)]
pub struct HarvesterHandle {
    tx: mpsc::UnboundedSender<HarvesterCommand>,
}

impl HarvesterHandle {
    /// Queues an event for delivery.
    ///
    /// Malformed events are rejected synchronously with no side effect; any
    /// later delivery failure is absorbed by the pipeline and visible only
    /// through [`HarvesterHandle::metrics`].
    pub fn insert(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        event.validate()?;
        self.tx
            .send(HarvesterCommand::Insert(event))
            .map_err(|_| TelemetryError::SchedulerGone)
    }

    /// Runs a harvest cycle now, regardless of the timer.
    pub async fn force_harvest(&self) -> Result<HarvestOutcome, TelemetryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HarvesterCommand::ForceHarvest(response_tx))
            .map_err(|_| TelemetryError::SchedulerGone)?;
        response_rx.await.map_err(|_| TelemetryError::SchedulerGone)
    }

    /// Replaces the base harvest interval and re-arms the timer.
    pub fn set_harvest_interval(&self, interval: Duration) -> Result<(), TelemetryError> {
        self.tx
            .send(HarvesterCommand::SetHarvestInterval(interval))
            .map_err(|_| TelemetryError::SchedulerGone)
    }

    /// Point-in-time metrics snapshot.
    pub async fn metrics(&self) -> Result<MetricsSnapshot, TelemetryError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(HarvesterCommand::GetMetrics(response_tx))
            .map_err(|_| TelemetryError::SchedulerGone)?;
        response_rx.await.map_err(|_| TelemetryError::SchedulerGone)
    }

    pub fn reset_metrics(&self) -> Result<(), TelemetryError> {
        self.tx
            .send(HarvesterCommand::ResetMetrics)
            .map_err(|_| TelemetryError::SchedulerGone)
    }

    /// Stops the scheduler without a final harvest. For teardown delivery,
    /// cancel the token passed at construction instead.
    pub fn shutdown(&self) -> Result<(), TelemetryError> {
        self.tx
            .send(HarvesterCommand::Shutdown)
            .map_err(|_| TelemetryError::SchedulerGone)
    }
}

/// The scheduler task. Construct it, then hand [`HarvesterService::run`] to
/// the runtime; the service is consumed, so a second start is unrepresentable.
pub struct HarvesterService {
    config: TelemetryConfig,
    buffer: EventBuffer,
    retry: RetryStore,
    transport: TransportClient,
    metrics: PipelineMetrics,
    snapshot_store: Box<dyn RetrySnapshotStore>,
    rx: mpsc::UnboundedReceiver<HarvesterCommand>,
    cancel: CancellationToken,
    base_interval: Duration,
    consecutive_failures: u32,
    is_harvesting: bool,
    final_harvest_done: bool,
}

#[derive(Serialize)]
struct Envelope<'a> {
    events: Vec<&'a TelemetryEvent>,
}

impl HarvesterService {
    /// Creates a scheduler with persistence disabled.
    pub fn new(
        config: TelemetryConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, HarvesterHandle), TelemetryError> {
        Self::with_snapshot_store(config, cancel, Box::new(NoopSnapshotStore))
    }

    /// Creates a scheduler that reloads and persists the retry store through
    /// the given durable slot. A failing slot degrades to an empty store.
    pub fn with_snapshot_store(
        config: TelemetryConfig,
        cancel: CancellationToken,
        mut snapshot_store: Box<dyn RetrySnapshotStore>,
    ) -> Result<(Self, HarvesterHandle), TelemetryError> {
        config.validate()?;
        let transport = TransportClient::new(&config)?;
        let mut retry = RetryStore::new(config.retry);
        match snapshot_store.load() {
            Ok(Some(snapshot)) => {
                debug!(items = snapshot.items.len(), "Restoring persisted retry snapshot");
                retry.restore(snapshot);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load retry snapshot, starting empty"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let base_interval = config.harvest.base_interval;
        let service = HarvesterService {
            buffer: EventBuffer::new(config.buffer),
            retry,
            transport,
            metrics: PipelineMetrics::default(),
            snapshot_store,
            rx,
            cancel,
            base_interval,
            consecutive_failures: 0,
            is_harvesting: false,
            final_harvest_done: false,
            config,
        };
        Ok((service, HarvesterHandle { tx }))
    }

    /// Runs the scheduling loop until shutdown, teardown, or the last handle
    /// is dropped. Teardown (token cancellation) issues exactly one forced
    /// final harvest with the constrained payload budget before exiting.
    pub async fn run(mut self) {
        debug!("Harvest scheduler started");
        let cancel = self.cancel.clone();
        let mut next_harvest = Instant::now() + self.next_interval();

        loop {
            let wake = self.next_wake(next_harvest);
            tokio::select! {
                () = cancel.cancelled() => {
                    self.final_harvest().await;
                    break;
                }
                command = self.rx.recv() => match command {
                    None => break,
                    Some(HarvesterCommand::Insert(event)) => {
                        match self.insert_event(event) {
                            Some(HarvestTrigger::Overflow { fill_percent }) => {
                                debug!(fill_percent, "Overflow trigger, harvesting immediately");
                                self.harvest(true, false).await;
                                next_harvest = Instant::now() + self.next_interval();
                            }
                            Some(HarvestTrigger::Smart { fill_percent }) => {
                                debug!(fill_percent, "Smart trigger, advancing the harvest timer");
                                let soon =
                                    Instant::now() + self.config.harvest.smart_trigger_delay;
                                next_harvest = next_harvest.min(soon);
                            }
                            None => {}
                        }
                    }
                    Some(HarvesterCommand::ForceHarvest(response_tx)) => {
                        let outcome = self.harvest(true, false).await;
                        next_harvest = Instant::now() + self.next_interval();
                        if response_tx.send(outcome).is_err() {
                            debug!("Force-harvest caller went away before the response");
                        }
                    }
                    Some(HarvesterCommand::SetHarvestInterval(interval)) => {
                        debug!(interval_ms = interval.as_millis() as u64, "Harvest interval updated");
                        self.base_interval = interval;
                        next_harvest = Instant::now() + self.next_interval();
                    }
                    Some(HarvesterCommand::GetMetrics(response_tx)) => {
                        let snapshot = self.metrics.snapshot(
                            self.buffer.count(),
                            self.buffer.size_bytes(),
                            self.retry.len(),
                            self.retry.discarded(),
                            self.retry.exhausted(),
                        );
                        if response_tx.send(snapshot).is_err() {
                            debug!("Metrics caller went away before the response");
                        }
                    }
                    Some(HarvesterCommand::ResetMetrics) => {
                        self.metrics.reset();
                        self.retry.reset_counters();
                    }
                    Some(HarvesterCommand::Shutdown) => {
                        debug!("Harvest scheduler shutting down");
                        break;
                    }
                },
                () = sleep_until(wake) => {
                    if Instant::now() >= next_harvest {
                        self.harvest(false, false).await;
                        next_harvest = Instant::now() + self.next_interval();
                    }
                    self.flush_due_retries().await;
                }
            }
        }
    }

    /// Validates and buffers a producer event, returning any fill trigger.
    fn insert_event(&mut self, event: TelemetryEvent) -> Option<HarvestTrigger> {
        if let Err(e) = event.validate() {
            self.metrics.events_rejected += 1;
            warn!(error = %e, "Rejecting malformed event");
            return None;
        }
        let result = self.buffer.insert(event);
        self.metrics.events_dropped += result.evicted as u64;
        match result.outcome {
            InsertOutcome::Queued | InsertOutcome::Replaced => self.metrics.events_added += 1,
            InsertOutcome::Rejected => self.metrics.events_rejected += 1,
        }
        result.trigger
    }

    /// One harvest cycle, guarded against re-entry across its await points.
    async fn harvest(&mut self, force: bool, is_final: bool) -> HarvestOutcome {
        if self.is_harvesting {
            warn!("Harvest cycle already in flight, skipping this trigger");
            return HarvestOutcome::AlreadyHarvesting;
        }
        if self.buffer.is_empty() && self.retry.is_empty() && !force {
            return HarvestOutcome::NoEvents;
        }
        self.is_harvesting = true;
        let outcome = self.run_harvest_cycle(is_final).await;
        self.is_harvesting = false;
        outcome
    }

    async fn run_harvest_cycle(&mut self, is_final: bool) -> HarvestOutcome {
        let started = Instant::now();
        let budget = self.chunk_budget(is_final);

        let fresh = self.buffer.drain();
        self.metrics.events_drained += fresh.len() as u64;

        // Retry items that fit the budget left over after the fresh events
        // go in front, so older retried events ship before newer ones.
        let fresh_bytes: usize = fresh.iter().map(|q| q.size).sum();
        let retried = self.retry.take_eligible(
            budget.max_bytes.saturating_sub(fresh_bytes),
            budget.max_events.saturating_sub(fresh.len()),
        );
        let mut combined: Vec<QueuedEvent> = retried
            .into_iter()
            .map(|item| QueuedEvent {
                event: item.event,
                size: item.size,
            })
            .collect();
        combined.extend(fresh);

        if combined.is_empty() {
            return HarvestOutcome::NoEvents;
        }

        if is_final {
            let deferred = trim_oldest_to_budget(&mut combined, budget.max_bytes);
            if !deferred.is_empty() {
                warn!(
                    count = deferred.len(),
                    "Final harvest over budget, deferring oldest events to the retry store"
                );
                self.retry.add_failed(deferred, FailureKind::TeardownDeferred);
            }
        }

        let mode = if is_final {
            TransportMode::Final
        } else {
            TransportMode::Normal
        };

        let mut chunks_sent = 0;
        let mut chunks_retried = 0;
        let mut chunks_dropped = 0;
        for chunk in chunk_events(combined, budget) {
            match self.send_chunk(&chunk, mode).await {
                ChunkFate::Delivered => chunks_sent += 1,
                ChunkFate::Retryable(failure) => {
                    chunks_retried += 1;
                    self.retry.add_failed(chunk, failure);
                }
                ChunkFate::Dropped => chunks_dropped += 1,
            }
        }

        if chunks_sent > 0 {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        let clean = chunks_retried == 0 && chunks_dropped == 0;
        self.metrics.record_harvest(started.elapsed(), clean);
        self.persist_retry();

        HarvestOutcome::Completed {
            chunks_sent,
            chunks_retried,
            chunks_dropped,
        }
    }

    /// Serializes and delivers one chunk, updating the request counters.
    async fn send_chunk(&mut self, chunk: &[QueuedEvent], mode: TransportMode) -> ChunkFate {
        let envelope = Envelope {
            events: chunk.iter().map(|q| &q.event).collect(),
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, events = chunk.len(), "Failed to serialize chunk, dropping");
                return ChunkFate::Dropped;
            }
        };

        self.metrics.requests_sent += 1;
        let outcome = self.transport.send(&payload, mode).await;
        if outcome.success() {
            self.metrics.requests_succeeded += 1;
            if outcome.deduplicated {
                self.metrics.requests_deduplicated += 1;
            }
            ChunkFate::Delivered
        } else if outcome.retryable {
            self.metrics.requests_failed += 1;
            ChunkFate::Retryable(outcome.failure_kind())
        } else {
            self.metrics.requests_failed += 1;
            error!(
                status = outcome.status.unwrap_or(0),
                events = chunk.len(),
                "Terminal transport failure, dropping chunk permanently"
            );
            ChunkFate::Dropped
        }
    }

    /// Resend attempt for items whose backoff timers have fired.
    ///
    /// Unlike the harvest-merge path, items here keep their retry identity:
    /// a failed attempt increments the per-item count and either reschedules
    /// or discards on exhaustion.
    async fn flush_due_retries(&mut self) {
        let due = self.retry.take_due(unix_millis());
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "Retry timers fired, attempting resend");

        let budget = self.chunk_budget(false);
        for group in chunk_events(due, budget) {
            let envelope = Envelope {
                events: group.iter().map(|item| &item.event).collect(),
            };
            let payload = match serde_json::to_vec(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "Failed to serialize retry group, dropping");
                    continue;
                }
            };

            self.metrics.requests_sent += 1;
            let outcome = self.transport.send(&payload, TransportMode::Normal).await;
            if outcome.success() {
                self.metrics.requests_succeeded += 1;
                if outcome.deduplicated {
                    self.metrics.requests_deduplicated += 1;
                }
                self.consecutive_failures = 0;
            } else {
                self.metrics.requests_failed += 1;
                if outcome.retryable {
                    self.retry.reschedule_failed(group, outcome.failure_kind());
                } else {
                    error!(
                        status = outcome.status.unwrap_or(0),
                        events = group.len(),
                        "Terminal transport failure on retry, dropping permanently"
                    );
                }
            }
        }
        self.persist_retry();
    }

    /// Exactly-once forced final harvest on the teardown path.
    async fn final_harvest(&mut self) {
        if self.final_harvest_done {
            return;
        }
        self.final_harvest_done = true;
        debug!("Teardown signal received, running final harvest");
        self.harvest(true, true).await;
    }

    fn chunk_budget(&self, is_final: bool) -> ChunkBudget {
        ChunkBudget {
            max_bytes: if is_final {
                self.config.chunk.final_max_bytes
            } else {
                self.config.chunk.max_bytes
            },
            max_events: self.config.chunk.max_events,
        }
    }

    fn next_interval(&self) -> Duration {
        adaptive_interval(
            &self.config.harvest,
            self.base_interval,
            self.consecutive_failures,
        )
    }

    /// Earliest of the harvest timer and the next retry deadline.
    fn next_wake(&self, next_harvest: Instant) -> Instant {
        match self.retry.next_due_in(unix_millis()) {
            Some(due_in) => next_harvest.min(Instant::now() + due_in),
            None => next_harvest,
        }
    }

    fn persist_retry(&mut self) {
        if let Err(e) = self.snapshot_store.save(&self.retry.snapshot()) {
            warn!(error = %e, "Failed to persist retry snapshot, continuing without");
        }
    }
}

/// What became of one chunk inside a harvest cycle.
enum ChunkFate {
    Delivered,
    Retryable(FailureKind),
    Dropped,
}

/// `base * multiplier^consecutive_failures`, clamped to the configured
/// bounds when adaptive scheduling is on; plain `base` otherwise.
fn adaptive_interval(
    config: &HarvestConfig,
    base: Duration,
    consecutive_failures: u32,
) -> Duration {
    if !config.adaptive {
        return base;
    }
    let scaled = base.as_millis() as f64
        * config
            .backoff_multiplier
            .powi(consecutive_failures.min(16) as i32);
    let clamped = scaled.clamp(
        config.min_interval.as_millis() as f64,
        config.max_interval.as_millis() as f64,
    );
    Duration::from_millis(clamped as u64)
}

/// Removes oldest events until the total fits `max_bytes`, returning them in
/// their original order. A single remaining event may still exceed the
/// budget; it ships alone rather than being dropped here.
fn trim_oldest_to_budget(combined: &mut Vec<QueuedEvent>, max_bytes: usize) -> Vec<QueuedEvent> {
    let mut total: usize = combined.iter().map(|q| q.size).sum();
    let mut cut = 0;
    while total > max_bytes && combined.len() - cut > 1 {
        total -= combined[cut].size;
        cut += 1;
    }
    combined.drain(..cut).collect()
}
