//! Core queue types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailqueue_core::{DomainError, EntryId};

/// Most urgent tier: password resets, receipts, other transactional sends.
pub const PRIORITY_TRANSACTIONAL: i32 = 1;
/// Automation/workflow sends.
pub const PRIORITY_AUTOMATION: i32 = 5;
/// Bulk broadcast sends. Lowest urgency and the enqueue default.
pub const PRIORITY_BROADCAST: i32 = 10;

/// Default attempt budget for a new entry.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How long an entry may sit in `processing` before it is presumed abandoned
/// and becomes claimable again.
pub const STUCK_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// `STUCK_TIMEOUT` as a chrono duration, for timestamp arithmetic.
pub fn stuck_timeout() -> chrono::Duration {
    chrono::Duration::seconds(STUCK_TIMEOUT.as_secs() as i64)
}

/// Lifecycle status of a queue entry.
///
/// Sent entries are deleted, so there is no `Sent` state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Last attempt failed; eligible again once `next_retry_at` passes
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "processing" => Ok(EntryStatus::Processing),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(DomainError::validation(format!("unknown entry status: {other}"))),
        }
    }
}

/// What produced the entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Broadcast,
    Transactional,
    Automation,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Broadcast => "broadcast",
            SourceType::Transactional => "transactional",
            SourceType::Automation => "automation",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcast" => Ok(SourceType::Broadcast),
            "transactional" => Ok(SourceType::Transactional),
            "automation" => Ok(SourceType::Automation),
            other => Err(DomainError::validation(format!("unknown source type: {other}"))),
        }
    }
}

/// Email provider the entry is routed through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Smtp,
    Ses,
    SparkPost,
    Postmark,
    Mailgun,
    Mailjet,
    SendGrid,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Smtp => "smtp",
            ProviderKind::Ses => "ses",
            ProviderKind::SparkPost => "sparkpost",
            ProviderKind::Postmark => "postmark",
            ProviderKind::Mailgun => "mailgun",
            ProviderKind::Mailjet => "mailjet",
            ProviderKind::SendGrid => "sendgrid",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smtp" => Ok(ProviderKind::Smtp),
            "ses" => Ok(ProviderKind::Ses),
            "sparkpost" => Ok(ProviderKind::SparkPost),
            "postmark" => Ok(ProviderKind::Postmark),
            "mailgun" => Ok(ProviderKind::Mailgun),
            "mailjet" => Ok(ProviderKind::Mailjet),
            "sendgrid" => Ok(ProviderKind::SendGrid),
            other => Err(DomainError::validation(format!("unknown provider kind: {other}"))),
        }
    }
}

/// One queued email send and its attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub status: EntryStatus,
    /// Lower is serviced first
    pub priority: i32,
    pub source_type: SourceType,
    pub source_id: String,
    pub integration_id: String,
    pub provider_kind: ProviderKind,
    pub contact_email: String,
    pub message_id: String,
    pub template_id: String,
    /// Opaque data needed to render and send the message
    pub payload: serde_json::Value,
    /// Claims so far (starts at 0)
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Whether a `fetch_pending` call at `now` would return this entry.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Pending => self.next_retry_at.map_or(true, |at| at <= now),
            EntryStatus::Failed => {
                self.attempts < self.max_attempts
                    && self.next_retry_at.map_or(false, |at| at <= now)
            }
            EntryStatus::Processing => self.is_stuck(now),
        }
    }

    /// Whether a `mark_as_processing` call at `now` would succeed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            EntryStatus::Pending | EntryStatus::Failed => true,
            EntryStatus::Processing => self.is_stuck(now),
        }
    }

    /// A `processing` entry whose claimant has not reported back within the
    /// stuck timeout.
    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Processing && self.updated_at < now - stuck_timeout()
    }

    /// Whether the attempt budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Claim ordering: priority ascending, then FIFO within a tier.
    pub(crate) fn claim_order(&self) -> (i32, DateTime<Utc>, EntryId) {
        (self.priority, self.created_at, self.id)
    }

    /// Move into `processing` and charge one attempt.
    pub(crate) fn claim(&mut self, now: DateTime<Utc>) -> ClaimedEntry {
        let previous_status = self.status;
        self.status = EntryStatus::Processing;
        self.attempts += 1;
        self.updated_at = now;
        ClaimedEntry {
            entry: self.clone(),
            previous_status,
        }
    }
}

/// An entry the caller now holds exclusively (attempts already incremented).
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEntry {
    pub entry: QueueEntry,
    /// Status before the claim. `Processing` means the entry was recovered
    /// from a worker that stopped reporting back.
    pub previous_status: EntryStatus,
}

impl ClaimedEntry {
    /// Whether this claim took the entry back after the stuck timeout.
    pub fn is_reclaim(&self) -> bool {
        self.previous_status == EntryStatus::Processing
    }

    pub fn into_entry(self) -> QueueEntry {
        self.entry
    }
}

/// Outcome of a conditional claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ClaimedEntry),
    /// Another worker won, or the entry was resolved/removed. Skip it.
    Lost,
}

impl ClaimOutcome {
    pub fn into_entry(self) -> Option<QueueEntry> {
        match self {
            ClaimOutcome::Claimed(claim) => Some(claim.entry),
            ClaimOutcome::Lost => None,
        }
    }

    pub fn into_claim(self) -> Option<ClaimedEntry> {
        match self {
            ClaimOutcome::Claimed(claim) => Some(claim),
            ClaimOutcome::Lost => None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

/// Live counts of queue rows by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.failed
    }

    pub(crate) fn record(&mut self, status: EntryStatus) {
        match status {
            EntryStatus::Pending => self.pending += 1,
            EntryStatus::Processing => self.processing += 1,
            EntryStatus::Failed => self.failed += 1,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay schedule used when a failed attempt is charged against the budget.
///
/// The attempt budget itself lives on each entry (`max_attempts`); this only
/// decides how far `next_retry_at` is pushed out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// When the next attempt should run, given the attempt that just failed.
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64))
    }
}
