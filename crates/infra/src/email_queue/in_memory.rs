//! In-memory queue store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailqueue_core::{Clock, EntryId, SystemClock};

use super::enqueue::{NewQueueEntry, prepare_batch};
use super::store::{EmailQueueStore, QueueError};
use super::types::{ClaimOutcome, ClaimedEntry, EntryStatus, QueueEntry, QueueStats, SourceType};

/// In-memory email queue.
///
/// Every operation runs under one lock, which makes each call atomic the way a
/// single SQL statement is. That is what lets it stand in for the database in
/// claim-race tests; it is not a cross-process coordination mechanism.
pub struct InMemoryEmailQueueStore {
    entries: Mutex<HashMap<EntryId, QueueEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEmailQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<EntryId, QueueEntry>>, QueueError> {
        self.entries
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))
    }

    fn sorted(mut entries: Vec<QueueEntry>) -> Vec<QueueEntry> {
        entries.sort_by_key(|e| e.claim_order());
        entries
    }
}

impl Default for InMemoryEmailQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEmailQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("InMemoryEmailQueueStore")
            .field("entries", &len)
            .finish()
    }
}

#[async_trait]
impl EmailQueueStore for InMemoryEmailQueueStore {
    async fn enqueue(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<EntryId>, QueueError> {
        if entries.is_empty() {
            return Ok(vec![]);
        }

        let rows = prepare_batch(entries, self.clock.now())?;

        let mut map = self.lock()?;
        if let Some(existing) = rows.iter().find(|row| map.contains_key(&row.id)) {
            return Err(QueueError::AlreadyExists(existing.id));
        }

        let ids = rows.iter().map(|row| row.id).collect();
        for row in rows {
            map.insert(row.id, row);
        }
        Ok(ids)
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let now = self.clock.now();
        let map = self.lock()?;

        let mut candidates = Self::sorted(
            map.values()
                .filter(|e| e.is_eligible(now))
                .cloned()
                .collect(),
        );
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn mark_as_processing(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        match map.get_mut(&id) {
            Some(entry) if entry.is_claimable(now) => Ok(ClaimOutcome::Claimed(entry.claim(now))),
            _ => Ok(ClaimOutcome::Lost),
        }
    }

    async fn try_claim_eligible(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        match map.get_mut(&id) {
            Some(entry) if entry.is_eligible(now) => Ok(ClaimOutcome::Claimed(entry.claim(now))),
            _ => Ok(ClaimOutcome::Lost),
        }
    }

    /// Selection and claim happen under one lock, like the single-statement
    /// Postgres claim.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEntry>, QueueError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        let mut candidates: Vec<_> = map
            .values()
            .filter(|e| e.is_eligible(now))
            .map(|e| (e.claim_order(), e.id))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        Ok(candidates
            .into_iter()
            .filter_map(|(_, id)| map.get_mut(&id).map(|entry| entry.claim(now)))
            .collect())
    }

    async fn mark_as_sent(&self, id: EntryId) -> Result<u64, QueueError> {
        let mut map = self.lock()?;
        Ok(map.remove(&id).map_or(0, |_| 1))
    }

    async fn mark_as_failed(
        &self,
        id: EntryId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        match map.get_mut(&id) {
            Some(entry) => {
                entry.status = EntryStatus::Failed;
                entry.last_error = Some(error.to_string());
                entry.next_retry_at = Some(next_retry_at);
                entry.updated_at = now;
                entry.processed_at = Some(now);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn set_next_retry(&self, id: EntryId, at: DateTime<Utc>) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let mut map = self.lock()?;

        match map.get_mut(&id) {
            Some(entry) => {
                entry.status = EntryStatus::Pending;
                entry.next_retry_at = Some(at);
                entry.updated_at = now;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete(&self, id: EntryId) -> Result<u64, QueueError> {
        let mut map = self.lock()?;
        Ok(map.remove(&id).map_or(0, |_| 1))
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError> {
        let map = self.lock()?;
        Ok(map.get(&id).cloned())
    }

    async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let map = self.lock()?;
        let mut stats = QueueStats::default();
        for entry in map.values() {
            stats.record(entry.status);
        }
        Ok(stats)
    }

    async fn get_by_source_id(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let map = self.lock()?;
        Ok(Self::sorted(
            map.values()
                .filter(|e| e.source_type == source_type && e.source_id == source_id)
                .cloned()
                .collect(),
        ))
    }

    async fn count_by_source_and_status(
        &self,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueError> {
        let map = self.lock()?;
        Ok(map
            .values()
            .filter(|e| {
                e.source_type == source_type && e.source_id == source_id && e.status == status
            })
            .count() as u64)
    }
}
