/// Errors surfaced by the telemetry pipeline.
///
/// Producers are fire-and-forget: delivery failures are absorbed internally
/// and show up in the metrics surface, never here. This enum only covers
/// construction-time problems and synchronous producer-input rejection.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),

    #[error("Retry snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("Harvest scheduler is not running")]
    SchedulerGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TelemetryError::InvalidConfig("missing license key".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: missing license key"
        );
    }

    #[test]
    fn test_invalid_event_display() {
        let error = TelemetryError::InvalidEvent("empty action name".to_string());
        assert!(error.to_string().contains("empty action name"));
    }
}
