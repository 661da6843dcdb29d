//! Sync state store: the three values that survive between syncs.
//!
//! Stored as one small JSON document. Writes are atomic: write to a temp
//! file, sync, then rename over the old state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use inklink_core::wire::DeviceEvent;

use crate::coordinator::SyncReport;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub last_sync: Option<DateTime<Utc>>,
    /// Fingerprint of the last content the device confirmed receiving.
    pub last_fingerprint: Option<String>,
    /// Unix seconds; the `since` cursor of the next event-log request.
    pub last_event_log_timestamp: u32,
}

impl SyncState {
    /// Fold a sync report into the persisted state.
    ///
    /// `last_sync` only moves on a completed sync and the fingerprint only
    /// when content was pushed. The event-log cursor moves to the
    /// completion time when the device returned an event-log batch.
    pub fn apply(&mut self, report: &SyncReport) {
        if let Some(fingerprint) = &report.fingerprint_to_persist {
            self.last_fingerprint = Some(fingerprint.clone());
        }
        if let Some(completed_at) = report.completed_at {
            self.last_sync = Some(completed_at);

            let got_batch = report
                .received
                .iter()
                .any(|m| DeviceEvent::from_u8(m.type_tag) == Some(DeviceEvent::EventLogBatch));
            if got_batch {
                self.last_event_log_timestamp =
                    u32::try_from(completed_at.timestamp().max(0)).unwrap_or(u32::MAX);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state. A missing file is a fresh install, not an error.
    pub fn load(&self) -> Result<SyncState, StoreError> {
        if !self.path.exists() {
            return Ok(SyncState::default());
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| StoreError::ReadFailed(self.path.clone(), e))?;
        serde_json::from_str(&text).map_err(|e| StoreError::ParseFailed(self.path.clone(), e))
    }

    pub fn save(&self, state: &SyncState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::WriteFailed(self.path.clone(), e))?;
        }
        let json = serde_json::to_vec_pretty(state).map_err(StoreError::SerializeFailed)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .map_err(|e| StoreError::WriteFailed(tmp_path.clone(), e))?;
            file.write_all(&json)
                .map_err(|e| StoreError::WriteFailed(tmp_path.clone(), e))?;
            file.sync_all()
                .map_err(|e| StoreError::WriteFailed(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| StoreError::WriteFailed(self.path.clone(), e))?;

        tracing::debug!(path = %self.path.display(), "sync state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use inklink_core::wire::ReceivedMessage;

    use crate::coordinator::{SyncError, SyncOutcome, SyncStage};
    use crate::link::LinkError;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("inklink-store-{}-{}", name, std::process::id()))
            .join("state.json")
    }

    fn report(outcome: SyncOutcome) -> SyncReport {
        SyncReport {
            outcome,
            content_pushed: false,
            fingerprint_to_persist: None,
            completed_at: None,
            connect_attempts: 1,
            push_attempts: 0,
            received: Vec::new(),
            refresh_requested: false,
        }
    }

    #[test]
    fn missing_file_is_default_state() {
        let store = StateStore::new(temp_path("missing"));
        assert_eq!(store.load().unwrap(), SyncState::default());
    }

    #[test]
    fn save_then_load() {
        let path = temp_path("roundtrip");
        let store = StateStore::new(&path);
        let state = SyncState {
            last_sync: Some(Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()),
            last_fingerprint: Some("ab12".into()),
            last_event_log_timestamp: 1_767_000_000,
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
        assert!(!path.with_extension("tmp").exists());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(StoreError::ParseFailed(..))
        ));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn completed_push_advances_everything() {
        let done = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
        let mut r = report(SyncOutcome::Completed);
        r.content_pushed = true;
        r.fingerprint_to_persist = Some("feed".into());
        r.completed_at = Some(done);
        r.received = vec![ReceivedMessage::new(0x21, vec![0u8])];

        let mut state = SyncState::default();
        state.apply(&r);
        assert_eq!(state.last_sync, Some(done));
        assert_eq!(state.last_fingerprint.as_deref(), Some("feed"));
        assert_eq!(state.last_event_log_timestamp, done.timestamp() as u32);
    }

    #[test]
    fn completed_without_push_keeps_fingerprint() {
        let done = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
        let mut r = report(SyncOutcome::Completed);
        r.completed_at = Some(done);

        let mut state = SyncState {
            last_fingerprint: Some("old".into()),
            last_event_log_timestamp: 7,
            ..SyncState::default()
        };
        state.apply(&r);
        assert_eq!(state.last_sync, Some(done));
        assert_eq!(state.last_fingerprint.as_deref(), Some("old"));
        assert_eq!(state.last_event_log_timestamp, 7);
    }

    #[test]
    fn failed_sync_changes_nothing() {
        let r = report(SyncOutcome::Failed {
            stage: SyncStage::Connect,
            error: SyncError::Link(LinkError::DeviceNotFound),
        });
        let mut state = SyncState::default();
        state.apply(&r);
        assert_eq!(state, SyncState::default());
    }
}
