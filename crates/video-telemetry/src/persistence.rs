//! Optional durable slot for the retry store.
//!
//! The scheduler writes a snapshot after retry-store mutations and reloads it
//! once at startup so pending retries survive a full process restart. This is
//! strictly best-effort: a failing slot is logged and ignored, never fatal to
//! normal operation.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::TelemetryError;
use crate::retry::RetrySnapshot;

/// A durable key-value slot holding the serialized retry store.
pub trait RetrySnapshotStore: Send {
    /// Persists the snapshot, replacing any previous one.
    fn save(&mut self, snapshot: &RetrySnapshot) -> Result<(), TelemetryError>;
    /// Loads the previously persisted snapshot, `None` when the slot is empty.
    fn load(&mut self) -> Result<Option<RetrySnapshot>, TelemetryError>;
}

/// Disabled persistence; every operation is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotStore;

impl RetrySnapshotStore for NoopSnapshotStore {
    fn save(&mut self, _snapshot: &RetrySnapshot) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn load(&mut self) -> Result<Option<RetrySnapshot>, TelemetryError> {
        Ok(None)
    }
}

/// JSON file slot. Writes go through a temp file followed by a rename so a
/// crash mid-write cannot corrupt the previous snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSnapshotStore { path: path.into() }
    }
}

impl RetrySnapshotStore for FileSnapshotStore {
    fn save(&mut self, snapshot: &RetrySnapshot) -> Result<(), TelemetryError> {
        let bytes = serde_json::to_vec(snapshot)
            .map_err(|e| TelemetryError::Persistence(format!("serialize: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| TelemetryError::Persistence(format!("write: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| TelemetryError::Persistence(format!("rename: {e}")))?;
        debug!(path = %self.path.display(), items = snapshot.items.len(), "Persisted retry snapshot");
        Ok(())
    }

    fn load(&mut self) -> Result<Option<RetrySnapshot>, TelemetryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TelemetryError::Persistence(format!("read: {e}"))),
        };
        let snapshot = serde_json::from_slice(&bytes)
            .map_err(|e| TelemetryError::Persistence(format!("deserialize: {e}")))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{EventType, TelemetryEvent};
    use crate::retry::{FailureKind, RetryItem};

    fn sample_snapshot() -> RetrySnapshot {
        RetrySnapshot {
            items: vec![RetryItem {
                event: TelemetryEvent::new(EventType::VideoAction, "CONTENT_START"),
                size: 120,
                retry_count: 1,
                first_failure_ms: 1_700_000_000_000,
                last_error: FailureKind::HttpStatus(503),
                next_attempt_ms: 1_700_000_002_000,
            }],
        }
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileSnapshotStore::new(dir.path().join("retry.json"));

        assert!(store.load().unwrap().is_none());

        store.save(&sample_snapshot()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].retry_count, 1);
        assert_eq!(loaded.items[0].last_error, FailureKind::HttpStatus(503));
    }

    #[test]
    fn test_file_store_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileSnapshotStore::new(dir.path().join("retry.json"));

        store.save(&sample_snapshot()).unwrap();
        store.save(&RetrySnapshot::default()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.items.is_empty());
    }

    #[test]
    fn test_corrupt_slot_reports_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry.json");
        std::fs::write(&path, b"not json").unwrap();

        let mut store = FileSnapshotStore::new(path);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_noop_store() {
        let mut store = NoopSnapshotStore;
        store.save(&sample_snapshot()).unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
