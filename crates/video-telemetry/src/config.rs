//! Pipeline configuration.
//!
//! Every component is constructed from an explicit [`TelemetryConfig`] passed
//! at creation time; there is no ambient global settings object. Defaults are
//! production values, `validate()` catches misconfiguration up front.

use std::time::Duration;

use crate::error::TelemetryError;

/// Identity of the ingestion endpoint and the reporting agent.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Collector base URL, e.g. `https://collector.example.com`.
    pub collector_url: String,
    /// Account license key, embedded in the intake path.
    pub license_key: String,
    /// Application identifier.
    pub app_id: String,
    /// Optional sub-account identifier.
    pub sub_account: Option<String>,
    /// Reporting library version.
    pub library_version: String,
    /// Page or session reference the events belong to.
    pub page_reference: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            collector_url: String::new(),
            license_key: String::new(),
            app_id: String::new(),
            sub_account: None,
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            page_reference: String::new(),
        }
    }
}

/// Event buffer bounds and fill-threshold triggers.
#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    /// Maximum queued events before FIFO eviction.
    pub max_events: usize,
    /// Maximum summed serialized size before FIFO eviction.
    pub max_payload_bytes: usize,
    /// Fill fraction that fires an advisory early-harvest trigger.
    pub smart_threshold: f64,
    /// Fill fraction that fires an urgent harvest trigger.
    pub overflow_threshold: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_events: 1_000,
            max_payload_bytes: 1_000_000,
            smart_threshold: 0.6,
            overflow_threshold: 0.9,
        }
    }
}

/// Harvest timer behavior.
#[derive(Debug, Clone, Copy)]
pub struct HarvestConfig {
    /// Interval between harvests when the pipeline is healthy.
    pub base_interval: Duration,
    /// Lower clamp for the adaptive interval.
    pub min_interval: Duration,
    /// Upper clamp for the adaptive interval.
    pub max_interval: Duration,
    /// Multiplier applied per consecutive failed harvest cycle.
    pub backoff_multiplier: f64,
    /// When false the interval is always `base_interval`.
    pub adaptive: bool,
    /// How soon after an advisory (smart) trigger the next harvest runs.
    pub smart_trigger_delay: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(10),
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            adaptive: true,
            smart_trigger_delay: Duration::from_secs(1),
        }
    }
}

/// Retry store policy: backoff curve, per-item budget and capacity.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Delivery attempts per item before permanent discard.
    pub max_retries: u32,
    /// Maximum stored items before oldest-first eviction.
    pub max_items: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            max_retries: 3,
            max_items: 500,
        }
    }
}

/// Transmission client behavior.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Per-request timeout for normal harvests.
    pub request_timeout: Duration,
    /// Per-request timeout for the best-effort final harvest.
    pub final_timeout: Duration,
    /// Maximum requests in flight at once.
    pub max_in_flight: usize,
    /// Rolling one-minute request ceiling; excess requests wait.
    pub max_requests_per_minute: usize,
    /// Skip resending a payload whose content hash succeeded recently.
    pub dedup_enabled: bool,
    /// Trailing window for content-hash deduplication.
    pub dedup_window: Duration,
    /// Also treat HTTP 512-530 as retryable.
    pub extended_retryable_range: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            final_timeout: Duration::from_secs(3),
            max_in_flight: 3,
            max_requests_per_minute: 120,
            dedup_enabled: true,
            dedup_window: Duration::from_secs(300),
            extended_retryable_range: false,
        }
    }
}

/// Per-chunk budgets for normal and final harvests.
#[derive(Debug, Clone, Copy)]
pub struct ChunkConfig {
    /// Maximum serialized bytes per chunk on the normal path.
    pub max_bytes: usize,
    /// Maximum events per chunk.
    pub max_events: usize,
    /// Smaller byte budget for the constrained teardown transport.
    pub final_max_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1_000_000,
            max_events: 1_000,
            final_max_bytes: 60_000,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub endpoint: EndpointConfig,
    pub buffer: BufferConfig,
    pub harvest: HarvestConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    pub chunk: ChunkConfig,
}

impl TelemetryConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.endpoint.collector_url.trim().is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "collector URL cannot be empty".to_string(),
            ));
        }
        if !self.endpoint.collector_url.starts_with("http") {
            return Err(TelemetryError::InvalidConfig(format!(
                "collector URL must be http(s): {}",
                self.endpoint.collector_url
            )));
        }
        if self.endpoint.license_key.trim().is_empty() {
            return Err(TelemetryError::InvalidConfig(
                "license key cannot be empty".to_string(),
            ));
        }
        if self.buffer.max_events == 0 || self.buffer.max_payload_bytes == 0 {
            return Err(TelemetryError::InvalidConfig(
                "buffer limits must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.buffer.smart_threshold)
            || !(0.0..=1.0).contains(&self.buffer.overflow_threshold)
            || self.buffer.smart_threshold >= self.buffer.overflow_threshold
        {
            return Err(TelemetryError::InvalidConfig(
                "buffer thresholds must satisfy 0 <= smart < overflow <= 1".to_string(),
            ));
        }
        if self.harvest.min_interval > self.harvest.max_interval {
            return Err(TelemetryError::InvalidConfig(
                "min harvest interval cannot exceed max harvest interval".to_string(),
            ));
        }
        if self.harvest.backoff_multiplier < 1.0 || self.retry.backoff_multiplier < 1.0 {
            return Err(TelemetryError::InvalidConfig(
                "backoff multipliers must be >= 1.0".to_string(),
            ));
        }
        if self.transport.max_in_flight == 0 || self.transport.max_requests_per_minute == 0 {
            return Err(TelemetryError::InvalidConfig(
                "transport concurrency and rate limits must be greater than 0".to_string(),
            ));
        }
        if self.chunk.max_bytes == 0 || self.chunk.max_events == 0 || self.chunk.final_max_bytes == 0
        {
            return Err(TelemetryError::InvalidConfig(
                "chunk budgets must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Assembles the intake URL the transmission client posts to.
    ///
    /// The path carries the license key; application identity and page
    /// reference ride in the query string together with a fixed category tag.
    pub fn intake_url(&self) -> String {
        let base = self.endpoint.collector_url.trim_end_matches('/');
        let mut url = format!(
            "{}/events/1/{}?app={}&ver={}&ref={}&category=video",
            base,
            self.endpoint.license_key,
            self.endpoint.app_id,
            self.endpoint.library_version,
            self.endpoint.page_reference,
        );
        if let Some(sub_account) = &self.endpoint.sub_account {
            url.push_str("&sub=");
            url.push_str(sub_account);
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> TelemetryConfig {
        TelemetryConfig {
            endpoint: EndpointConfig {
                collector_url: "https://collector.example.com".to_string(),
                license_key: "lk-1234".to_string(),
                app_id: "app-1".to_string(),
                sub_account: None,
                library_version: "0.1.0".to_string(),
                page_reference: "main".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_default_config_missing_identity_fails() {
        assert!(TelemetryConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = valid_config();
        config.buffer.smart_threshold = 0.95;
        config.buffer.overflow_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = valid_config();
        config.buffer.max_events = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let mut config = valid_config();
        config.harvest.min_interval = Duration::from_secs(90);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_intake_url_shape() {
        let mut config = valid_config();
        config.endpoint.sub_account = Some("sub-7".to_string());
        let url = config.intake_url();
        assert!(url.starts_with("https://collector.example.com/events/1/lk-1234?"));
        assert!(url.contains("app=app-1"));
        assert!(url.contains("category=video"));
        assert!(url.contains("&sub=sub-7"));
    }
}
