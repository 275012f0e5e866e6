//! Best-effort draft mirroring and the post-auth transfer slot.
//!
//! Nothing here returns an error to the flow: storage that is full,
//! disabled or corrupt just behaves as if no draft existed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use super::answers::AnswerStore;
use super::db::KeyValueStore;
use crate::observability;

pub const DEFAULT_TRANSFER_KEY: &str = "instantmed_auth_transfer";
pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftData {
    pub answers: serde_json::Map<String, serde_json::Value>,
    pub current_step: String,
}

/// Stored envelope for one flow's draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSnapshot {
    pub data: DraftData,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    /// Monotonic across sessions sharing the key.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl DraftSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: u64 },
    /// Another session wrote a newer draft since we last looked.
    Superseded { stored_version: u64 },
    /// Storage refused the write; ignored.
    Failed,
}

/// Draft storage for one flow in one session.
pub struct DraftAdapter {
    store: Arc<dyn KeyValueStore>,
    key: String,
    transfer_key: String,
    session_id: String,
    max_age: chrono::Duration,
    observed_version: Mutex<u64>,
}

impl DraftAdapter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: &str,
        transfer_key: &str,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            store,
            key: key.to_string(),
            transfer_key: transfer_key.to_string(),
            session_id: uuid::Uuid::new_v4().to_string(),
            max_age,
            observed_version: Mutex::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stored draft as-is, without expiry checks or deletion.
    pub fn peek(&self) -> Option<DraftSnapshot> {
        let raw = match self.store.get(&self.key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::debug!("draft read failed for '{}': {e:#}", self.key);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!("unreadable draft under '{}': {e}", self.key);
                None
            }
        }
    }

    /// Remember the stored version so later writes from this session do not
    /// count as stale.
    pub fn observe_stored(&self) {
        if let Some(snapshot) = self.peek() {
            self.observe(snapshot.version);
        }
    }

    fn observe(&self, version: u64) {
        let mut observed = self
            .observed_version
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *observed = (*observed).max(version);
    }

    /// The draft worth offering for recovery, if any. Expired, first-step
    /// and unreadable drafts are deleted.
    pub fn load_recoverable(&self, first_step: &str, now: DateTime<Utc>) -> Option<DraftSnapshot> {
        let present = match self.store.get(&self.key) {
            Ok(raw) => raw.is_some(),
            Err(e) => {
                tracing::debug!("draft read failed for '{}': {e:#}", self.key);
                return None;
            }
        };
        if !present {
            return None;
        }

        let Some(snapshot) = self.peek() else {
            self.discard();
            return None;
        };
        if snapshot.age(now) >= self.max_age {
            tracing::debug!(
                "discarding draft '{}' saved {}h ago",
                self.key,
                snapshot.age(now).num_hours()
            );
            self.discard();
            return None;
        }
        if snapshot.data.current_step == first_step {
            self.discard();
            return None;
        }

        self.observe(snapshot.version);
        Some(snapshot)
    }

    /// Write the current answers and step, unless another session has
    /// written a newer draft since this one last observed the key.
    pub fn write(&self, answers: &AnswerStore, current_step: &str, now: DateTime<Utc>) -> WriteOutcome {
        let mut observed = self
            .observed_version
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let stored = self.peek();

        if let Some(ref s) = stored {
            let ours = s.session_id.as_deref() == Some(self.session_id.as_str());
            if !ours && s.version > *observed {
                tracing::warn!(
                    "draft '{}' was updated elsewhere (v{} > v{}), not overwriting",
                    self.key,
                    s.version,
                    *observed
                );
                record_write("superseded");
                return WriteOutcome::Superseded {
                    stored_version: s.version,
                };
            }
        }

        let version = stored.map_or(0, |s| s.version).max(*observed) + 1;
        let snapshot = DraftSnapshot {
            data: DraftData {
                answers: answers.to_json(),
                current_step: current_step.to_string(),
            },
            timestamp: now,
            version,
            session_id: Some(self.session_id.clone()),
        };

        let result = serde_json::to_string(&snapshot)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&self.key, &json));
        match result {
            Ok(()) => {
                *observed = version;
                record_write("written");
                WriteOutcome::Written { version }
            }
            Err(e) => {
                tracing::debug!("draft write failed for '{}': {e:#}", self.key);
                record_write("failed");
                WriteOutcome::Failed
            }
        }
    }

    pub fn discard(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            tracing::debug!("draft delete failed for '{}': {e:#}", self.key);
        }
    }

    /// Park answers before sending the patient to an external auth page.
    pub fn stash_transfer(&self, answers: &AnswerStore) -> bool {
        let result = serde_json::to_string(&answers.to_json())
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&self.transfer_key, &json));
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("transfer stash failed: {e:#}");
                false
            }
        }
    }

    /// Read and delete the transfer slot. Consumed at most once.
    pub fn take_transfer(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let raw = match self.store.get(&self.transfer_key) {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::debug!("transfer read failed: {e:#}");
                return None;
            }
        };
        if let Err(e) = self.store.remove(&self.transfer_key) {
            tracing::debug!("transfer delete failed: {e:#}");
        }
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            Ok(_) | Err(_) => {
                tracing::debug!("ignoring malformed transfer slot");
                None
            }
        }
    }
}

fn record_write(outcome: &str) {
    observability::metrics()
        .draft_writes
        .with_label_values(&[outcome])
        .inc();
}
