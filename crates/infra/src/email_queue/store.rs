//! Queue store abstraction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailqueue_core::EntryId;

use super::enqueue::NewQueueEntry;
use super::types::{ClaimOutcome, ClaimedEntry, EntryStatus, QueueEntry, QueueStats, SourceType};

/// Queue store error.
///
/// A lost claim race is *not* an error: it is reported as
/// [`ClaimOutcome::Lost`] or as zero rows affected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("tenant storage unreachable: {0}")]
    Connection(String),
    #[error("payload could not be marshalled: {0}")]
    Marshal(String),
    #[error("invalid entry: {0}")]
    Validation(String),
    #[error("entry already exists: {0}")]
    AlreadyExists(EntryId),
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// Whether retrying the whole polling cycle later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Connection(_) | QueueError::DeadlineExceeded(_) | QueueError::Storage(_)
        )
    }
}

/// Tenant-agnostic email queue storage.
///
/// One store instance serves one tenant's queue; the tenant is chosen by the
/// [`ConnectionResolver`](crate::tenant::ConnectionResolver) that handed it out.
///
/// ## Claim semantics
///
/// Exclusivity comes from the storage engine, never from a lock held by the
/// caller: workers may live in different processes. `mark_as_processing` is a
/// single conditional update, and whoever loses the race sees
/// [`ClaimOutcome::Lost`].
///
/// ## Outcome operations
///
/// `mark_as_sent`, `mark_as_failed`, `set_next_retry` and `delete` return the
/// number of rows affected so callers can tell "already resolved" from a
/// real failure.
#[async_trait]
pub trait EmailQueueStore: Send + Sync {
    /// Persist a batch atomically. Empty input is a no-op.
    ///
    /// Returns the ids of the stored entries in input order.
    async fn enqueue(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<EntryId>, QueueError>;

    /// Up to `limit` eligible entries in claim order, without changing them.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError>;

    /// Atomically claim one entry, incrementing its attempt count.
    async fn mark_as_processing(&self, id: EntryId) -> Result<ClaimOutcome, QueueError>;

    /// Claim one entry only if it is still eligible right now.
    ///
    /// Unlike `mark_as_processing`, an entry that was failed or rescheduled
    /// into the future since it was fetched is reported as
    /// [`ClaimOutcome::Lost`].
    async fn try_claim_eligible(&self, id: EntryId) -> Result<ClaimOutcome, QueueError>;

    /// Claim up to `limit` eligible entries.
    ///
    /// Stores with a native skip-locked primitive override this with a single
    /// statement; the default fetches candidates and claims each one through
    /// `try_claim_eligible`, dropping the ones another worker got first.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEntry>, QueueError> {
        let candidates = self.fetch_pending(limit).await?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let ClaimOutcome::Claimed(claim) = self.try_claim_eligible(candidate.id).await? {
                claimed.push(claim);
            }
        }
        Ok(claimed)
    }

    /// Remove a delivered entry. Idempotent.
    async fn mark_as_sent(&self, id: EntryId) -> Result<u64, QueueError>;

    /// Record a failed attempt. Does not look at the attempt budget.
    async fn mark_as_failed(
        &self,
        id: EntryId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<u64, QueueError>;

    /// Reschedule without charging an attempt.
    async fn set_next_retry(&self, id: EntryId, at: DateTime<Utc>) -> Result<u64, QueueError>;

    /// Permanently remove an entry (e.g. once retries are exhausted).
    async fn delete(&self, id: EntryId) -> Result<u64, QueueError>;

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError>;

    async fn get_stats(&self) -> Result<QueueStats, QueueError>;

    async fn get_by_source_id(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueError>;

    async fn count_by_source_and_status(
        &self,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueError>;
}

#[async_trait]
impl<S> EmailQueueStore for Arc<S>
where
    S: EmailQueueStore + ?Sized,
{
    async fn enqueue(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<EntryId>, QueueError> {
        (**self).enqueue(entries).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).fetch_pending(limit).await
    }

    async fn mark_as_processing(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        (**self).mark_as_processing(id).await
    }

    async fn try_claim_eligible(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        (**self).try_claim_eligible(id).await
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEntry>, QueueError> {
        (**self).claim_batch(limit).await
    }

    async fn mark_as_sent(&self, id: EntryId) -> Result<u64, QueueError> {
        (**self).mark_as_sent(id).await
    }

    async fn mark_as_failed(
        &self,
        id: EntryId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        (**self).mark_as_failed(id, error, next_retry_at).await
    }

    async fn set_next_retry(&self, id: EntryId, at: DateTime<Utc>) -> Result<u64, QueueError> {
        (**self).set_next_retry(id, at).await
    }

    async fn delete(&self, id: EntryId) -> Result<u64, QueueError> {
        (**self).delete(id).await
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError> {
        (**self).get(id).await
    }

    async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        (**self).get_stats().await
    }

    async fn get_by_source_id(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).get_by_source_id(source_type, source_id).await
    }

    async fn count_by_source_and_status(
        &self,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueError> {
        (**self)
            .count_by_source_and_status(source_type, source_id, status)
            .await
    }
}
