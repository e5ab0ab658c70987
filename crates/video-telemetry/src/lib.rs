//! # Video Telemetry
//!
//! Client-side telemetry pipeline for video playback monitoring. Applications
//! push playback events (actions, errors, ad events, custom events) into a
//! bounded in-memory buffer; a background scheduler periodically harvests the
//! buffer, partitions the events into size-capped chunks, and delivers them to
//! an HTTP intake endpoint with retry, deduplication, and rate limiting.
//!
//! ## Architecture
//!
//! The pipeline is organized around a single scheduler task:
//! - [`buffer`]: bounded FIFO event buffer with byte and count limits
//! - [`harvester`]: harvest scheduling, adaptive intervals, teardown delivery
//! - [`chunker`]: greedy size-capped payload partitioning
//! - [`retry`]: dead-letter store with exponential backoff and jitter
//! - [`transport`]: HTTP delivery with dedup, rate limiting, and concurrency caps
//! - [`persistence`]: optional durable slot for the retry store
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use video_telemetry::{EventType, HarvesterService, TelemetryConfig, TelemetryEvent};
//!
//! # async fn example() -> Result<(), video_telemetry::TelemetryError> {
//! let mut config = TelemetryConfig::default();
//! config.endpoint.collector_url = "https://intake.example.com".to_string();
//! config.endpoint.license_key = "abc123".to_string();
//! config.endpoint.app_id = "player-1".to_string();
//!
//! let cancel = CancellationToken::new();
//! let (service, handle) = HarvesterService::new(config, cancel.clone())?;
//! tokio::spawn(service.run());
//!
//! handle.insert(TelemetryEvent::new(EventType::VideoAction, "CONTENT_START"))?;
//! # Ok(())
//! # }
//! ```
//!
//! Cancelling the token triggers exactly one final harvest with a constrained
//! payload budget before the scheduler exits.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]

/// Bounded FIFO event buffer with byte and count limits
pub mod buffer;

/// Greedy size-capped payload partitioning
pub mod chunker;

/// Pipeline configuration and validation
pub mod config;

/// Error types
pub mod error;

/// Telemetry event model
pub mod event;

/// Harvest scheduling and pipeline orchestration
pub mod harvester;

/// Pipeline counters and gauges
pub mod metrics;

/// Durable persistence for the retry store
pub mod persistence;

/// Dead-letter store with exponential backoff
pub mod retry;

/// HTTP delivery client
pub mod transport;

pub use buffer::{EventBuffer, HarvestTrigger, InsertOutcome, QueuedEvent};
pub use config::{
    BufferConfig, ChunkConfig, EndpointConfig, HarvestConfig, RetryConfig, TelemetryConfig,
    TransportConfig,
};
pub use error::TelemetryError;
pub use event::{AttributeValue, EventType, TelemetryEvent, AGGREGATE_ACTION};
pub use harvester::{HarvestOutcome, HarvesterHandle, HarvesterService};
pub use metrics::MetricsSnapshot;
pub use persistence::{FileSnapshotStore, NoopSnapshotStore, RetrySnapshotStore};
pub use retry::{FailureKind, RetryItem, RetrySnapshot, RetryStore};
pub use transport::{SendOutcome, TransportClient, TransportMode};
