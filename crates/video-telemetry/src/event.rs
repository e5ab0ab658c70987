//! Telemetry event record produced by player-side instrumentation.
//!
//! Events are flat mappings of string keys to scalar values. Four fields are
//! always present: the event category, an action name, a monotonic sequence
//! number assigned at buffer-insertion time, and the capture timestamp. The
//! remaining attributes are free-form scalars supplied by the producer.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;

/// Reserved action name for the aggregate quality-of-experience event.
///
/// At most one queued event may carry this action; inserting a second one
/// replaces the first in place instead of appending.
pub const AGGREGATE_ACTION: &str = "QOE_AGGREGATE";

/// Closed set of event categories accepted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Playback lifecycle events (start, pause, seek, end).
    VideoAction,
    /// Player and stream errors.
    VideoErrorAction,
    /// Ad lifecycle events.
    VideoAdAction,
    /// Producer-defined custom metrics.
    VideoCustomAction,
}

/// Scalar attribute value carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

/// A single instrumentation event.
///
/// Immutable once queued, except for the aggregate-merge rule handled by the
/// event buffer. The `sequence` field is `0` until the buffer assigns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "actionName")]
    pub action_name: String,
    pub sequence: u64,
    pub timestamp: i64,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl TelemetryEvent {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(event_type: EventType, action_name: impl Into<String>) -> Self {
        TelemetryEvent {
            event_type,
            action_name: action_name.into(),
            sequence: 0,
            timestamp: unix_millis(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attaches a scalar attribute, builder style.
    #[must_use]
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// True when this is the reserved aggregate quality-metrics event.
    pub fn is_aggregate(&self) -> bool {
        self.action_name == AGGREGATE_ACTION
    }

    /// Rejects malformed producer input before it reaches the buffer.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.action_name.trim().is_empty() {
            return Err(TelemetryError::InvalidEvent(
                "action name must not be empty".to_string(),
            ));
        }
        if self.attributes.keys().any(|k| k.trim().is_empty()) {
            return Err(TelemetryError::InvalidEvent(
                "attribute keys must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialized JSON size of this event in bytes.
    ///
    /// Used for all payload accounting. An event that fails to serialize
    /// reports size 0 and is rejected later during envelope construction.
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_has_timestamp() {
        let event = TelemetryEvent::new(EventType::VideoAction, "CONTENT_START");
        assert!(event.timestamp > 0);
        assert_eq!(event.sequence, 0);
        assert_eq!(event.action_name, "CONTENT_START");
    }

    #[test]
    fn test_with_attribute() {
        let event = TelemetryEvent::new(EventType::VideoAction, "CONTENT_START")
            .with_attribute("contentBitrate", 3_500_000_i64)
            .with_attribute("contentIsLive", false)
            .with_attribute("playerName", "html5");

        assert_eq!(event.attributes.len(), 3);
        assert_eq!(
            event.attributes.get("contentIsLive"),
            Some(&AttributeValue::Bool(false))
        );
    }

    #[test]
    fn test_is_aggregate() {
        let event = TelemetryEvent::new(EventType::VideoCustomAction, AGGREGATE_ACTION);
        assert!(event.is_aggregate());
        let event = TelemetryEvent::new(EventType::VideoAction, "CONTENT_PAUSE");
        assert!(!event.is_aggregate());
    }

    #[test]
    fn test_validate_rejects_empty_action() {
        let event = TelemetryEvent::new(EventType::VideoAction, "  ");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_attribute_key() {
        let event = TelemetryEvent::new(EventType::VideoAction, "CONTENT_START")
            .with_attribute("", "value");
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_serialized_size_matches_json() {
        let event = TelemetryEvent::new(EventType::VideoAction, "CONTENT_START")
            .with_attribute("contentSrc", "https://cdn.example.com/v.m3u8");
        let json = serde_json::to_vec(&event).unwrap();
        assert_eq!(event.serialized_size(), json.len());
    }

    #[test]
    fn test_serde_round_trip() {
        let event = TelemetryEvent::new(EventType::VideoErrorAction, "CONTENT_ERROR")
            .with_attribute("errorCode", 42_i64)
            .with_attribute("errorMessage", "decode failure");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"VideoErrorAction\""));
        assert!(json.contains("\"actionName\":\"CONTENT_ERROR\""));

        let back: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
