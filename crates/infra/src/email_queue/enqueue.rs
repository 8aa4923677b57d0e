//! Entry construction and enqueue-time validation.
//!
//! Both stores run their input through [`prepare_batch`] so defaults, id
//! generation and rejection happen identically before anything is persisted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use mailqueue_core::EntryId;

use super::store::QueueError;
use super::types::{
    DEFAULT_MAX_ATTEMPTS, EntryStatus, PRIORITY_BROADCAST, ProviderKind, QueueEntry, SourceType,
};

/// Largest attempt budget a store can persist (`INTEGER` column).
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// An entry as submitted by a producer.
///
/// Unset fields are filled in at enqueue time: a fresh id, the broadcast
/// priority tier and `DEFAULT_MAX_ATTEMPTS`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub id: Option<EntryId>,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub source_type: SourceType,
    pub source_id: String,
    pub integration_id: String,
    pub provider_kind: ProviderKind,
    pub contact_email: String,
    pub message_id: String,
    pub template_id: String,
    pub payload: serde_json::Value,
}

impl NewQueueEntry {
    pub fn new(
        source_type: SourceType,
        source_id: impl Into<String>,
        integration_id: impl Into<String>,
        provider_kind: ProviderKind,
        contact_email: impl Into<String>,
        message_id: impl Into<String>,
        template_id: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            priority: None,
            max_attempts: None,
            source_type,
            source_id: source_id.into(),
            integration_id: integration_id.into(),
            provider_kind,
            contact_email: contact_email.into(),
            message_id: message_id.into(),
            template_id: template_id.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attach an already-encoded payload.
    pub fn with_raw_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Encode and attach a typed payload.
    ///
    /// Fails with [`QueueError::Marshal`] if the value cannot be represented
    /// as JSON; such an entry never reaches the store.
    pub fn with_payload<T>(mut self, payload: &T) -> Result<Self, QueueError>
    where
        T: Serialize + ?Sized,
    {
        self.payload = serde_json::to_value(payload)
            .map_err(|e| QueueError::Marshal(format!("payload serialization failed: {e}")))?;
        Ok(self)
    }
}

/// Validate a batch and turn it into rows ready for insertion.
///
/// All-or-nothing: the first rejected entry fails the whole batch.
pub fn prepare_batch(
    entries: Vec<NewQueueEntry>,
    now: DateTime<Utc>,
) -> Result<Vec<QueueEntry>, QueueError> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut rows = Vec::with_capacity(entries.len());

    for (idx, entry) in entries.into_iter().enumerate() {
        if entry.contact_email.trim().is_empty() {
            return Err(QueueError::Validation(format!(
                "entry at index {idx} has an empty contact email"
            )));
        }
        match entry.max_attempts {
            Some(0) => {
                return Err(QueueError::Validation(format!(
                    "entry at index {idx} has max_attempts = 0"
                )));
            }
            Some(n) if n > MAX_ATTEMPTS_LIMIT => {
                return Err(QueueError::Validation(format!(
                    "entry at index {idx} has max_attempts = {n}, above {MAX_ATTEMPTS_LIMIT}"
                )));
            }
            _ => {}
        }

        let id = entry.id.unwrap_or_default();
        if !seen.insert(id) {
            return Err(QueueError::AlreadyExists(id));
        }

        rows.push(QueueEntry {
            id,
            status: EntryStatus::Pending,
            priority: entry.priority.unwrap_or(PRIORITY_BROADCAST),
            source_type: entry.source_type,
            source_id: entry.source_id,
            integration_id: entry.integration_id,
            provider_kind: entry.provider_kind,
            contact_email: entry.contact_email,
            message_id: entry.message_id,
            template_id: entry.template_id,
            payload: entry.payload,
            attempts: 0,
            max_attempts: entry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        });
    }

    Ok(rows)
}
