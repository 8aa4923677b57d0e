//! Delivery workers: claim, send, record the outcome.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use mailqueue_core::{Clock, SystemClock, TenantId};

use crate::tenant::ConnectionResolver;

use super::store::{EmailQueueStore, QueueError};
use super::types::{ClaimedEntry, QueueEntry, RetryPolicy};

/// Why a send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Worth retrying (timeouts, throttling, provider 5xx).
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Retrying cannot help (rejected address, invalid payload).
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// Email transport (SMTP or provider API).
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, entry: &QueueEntry) -> Result<(), SendError>;
}

/// What to do with a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Charge the attempt: `mark_as_failed` with a backoff.
    CountAttempt,
    /// Pause delivery without charging an attempt: `set_next_retry(at)`.
    Reschedule(DateTime<Utc>),
}

/// Circuit breaker calling contract.
///
/// How failures are classified is up to the implementation; the queue only
/// cares which of the two outcome calls it leads to.
pub trait CircuitBreaker: Send + Sync {
    fn on_failure(
        &self,
        entry: &QueueEntry,
        error: &SendError,
        now: DateTime<Utc>,
    ) -> FailureDisposition;

    fn record_success(&self, _entry: &QueueEntry) {}
}

/// Breaker that never trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCircuitBreaker;

impl CircuitBreaker for NoopCircuitBreaker {
    fn on_failure(&self, _: &QueueEntry, _: &SendError, _: DateTime<Utc>) -> FailureDisposition {
        FailureDisposition::CountAttempt
    }
}

/// How a claimed entry was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered and removed from the queue
    Sent,
    /// Attempt charged, retry scheduled
    Failed,
    /// Backed off without charging an attempt
    Rescheduled,
    /// Permanent failure, removed
    Dropped,
    /// Attempt budget used up, removed
    Exhausted,
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct DeliveryWorkerConfig {
    /// Name for logging
    pub name: String,
    /// Concurrent polling workers
    pub workers: usize,
    /// Entries claimed per cycle
    pub batch_size: usize,
    /// Sleep between cycles when idle
    pub poll_interval: Duration,
    /// Deadline for one claim call
    pub fetch_timeout: Duration,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self {
            name: "email-delivery".to_string(),
            workers: 4,
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl DeliveryWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Runtime statistics, summed over all workers of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub rescheduled: u64,
    pub dropped: u64,
    pub exhausted: u64,
    /// Outcome calls that errored; the entry is left for stuck recovery
    pub record_errors: u64,
    /// Cycles aborted by a resolver or claim error
    pub cycle_errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record_cycle(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.claimed += report.claimed as u64;
        self.record_errors += report.record_errors as u64;
        for outcome in &report.outcomes {
            match outcome {
                DeliveryOutcome::Sent => self.sent += 1,
                DeliveryOutcome::Failed => self.failed += 1,
                DeliveryOutcome::Rescheduled => self.rescheduled += 1,
                DeliveryOutcome::Dropped => self.dropped += 1,
                DeliveryOutcome::Exhausted => self.exhausted += 1,
            }
        }
    }
}

/// Result of one claim-and-deliver cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub outcomes: Vec<DeliveryOutcome>,
    pub record_errors: usize,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct DeliveryWorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl DeliveryWorkerHandle {
    /// Request graceful shutdown and wait for in-flight deliveries to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "delivery worker panicked");
            }
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Pool of delivery workers for one tenant's queue.
///
/// Workers never coordinate with each other: each one claims through the
/// store, so several pools (or processes) may drain the same queue.
#[derive(Clone)]
pub struct DeliveryWorkerPool {
    resolver: Arc<dyn ConnectionResolver>,
    sender: Arc<dyn EmailSender>,
    breaker: Arc<dyn CircuitBreaker>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorkerPool {
    pub fn new(resolver: Arc<dyn ConnectionResolver>, sender: Arc<dyn EmailSender>) -> Self {
        Self {
            resolver,
            sender,
            breaker: Arc::new(NoopCircuitBreaker),
            retry_policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn `config.workers` polling tasks for `tenant_id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(&self, tenant_id: TenantId, config: DeliveryWorkerConfig) -> DeliveryWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let config = Arc::new(config);

        let joins = (0..config.workers.max(1))
            .map(|worker| {
                let pool = self.clone();
                let config = config.clone();
                let shutdown = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    worker_loop(pool, tenant_id, worker, config, shutdown, stats).await;
                })
            })
            .collect();

        DeliveryWorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }

    /// Claim one batch for the tenant and deliver it.
    ///
    /// Every claimed entry is sent concurrently, so no send waits behind the
    /// rest of the batch while its claim ages toward the stuck timeout.
    ///
    /// Errors only when no entry could be claimed (resolver failure, claim
    /// failure, deadline). Outcome-recording failures are logged and counted;
    /// those entries stay `processing` until the stuck timeout frees them.
    pub async fn run_cycle(
        &self,
        tenant_id: TenantId,
        batch_size: usize,
        fetch_timeout: Duration,
    ) -> Result<CycleReport, QueueError> {
        let store = self.resolver.resolve(tenant_id).await?;

        let claimed = tokio::time::timeout(fetch_timeout, store.claim_batch(batch_size))
            .await
            .map_err(|_| QueueError::DeadlineExceeded(fetch_timeout))??;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..CycleReport::default()
        };

        let mut deliveries = JoinSet::new();
        for claim in claimed {
            let pool = self.clone();
            let store = store.clone();
            deliveries.spawn(async move {
                let entry_id = claim.entry.id;
                (entry_id, pool.deliver_one(store.as_ref(), claim).await)
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.outcomes.push(outcome),
                Ok((entry_id, Err(e))) => {
                    error!(tenant_id = %tenant_id, entry_id = %entry_id, error = %e, "failed to record delivery outcome");
                    report.record_errors += 1;
                }
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "delivery task crashed");
                    report.record_errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Send a claimed entry and record what happened.
    pub async fn deliver_one(
        &self,
        store: &dyn EmailQueueStore,
        claim: ClaimedEntry,
    ) -> Result<DeliveryOutcome, QueueError> {
        let reclaimed = claim.is_reclaim();
        let entry = claim.into_entry();

        // A claim resumed after a voluntary reschedule may sit above the
        // budget; only a crash recovery counts as a spent attempt here.
        if reclaimed && entry.attempts > entry.max_attempts {
            warn!(entry_id = %entry.id, attempts = entry.attempts, "attempt budget exceeded after stuck recovery, removing entry");
            store.delete(entry.id).await?;
            return Ok(DeliveryOutcome::Exhausted);
        }

        let error = match self.sender.send(&entry).await {
            Ok(()) => {
                store.mark_as_sent(entry.id).await?;
                self.breaker.record_success(&entry);
                debug!(entry_id = %entry.id, attempts = entry.attempts, "email sent");
                return Ok(DeliveryOutcome::Sent);
            }
            Err(error) => error,
        };

        if let SendError::Permanent(reason) = &error {
            warn!(entry_id = %entry.id, reason = %reason, "permanent send failure, removing entry");
            store.delete(entry.id).await?;
            return Ok(DeliveryOutcome::Dropped);
        }

        let now = self.clock.now();
        match self.breaker.on_failure(&entry, &error, now) {
            FailureDisposition::Reschedule(at) => {
                debug!(entry_id = %entry.id, retry_at = %at, "delivery paused by circuit breaker");
                store.set_next_retry(entry.id, at).await?;
                Ok(DeliveryOutcome::Rescheduled)
            }
            FailureDisposition::CountAttempt if entry.is_exhausted() => {
                warn!(entry_id = %entry.id, attempts = entry.attempts, error = %error, "retries exhausted, removing entry");
                store.delete(entry.id).await?;
                Ok(DeliveryOutcome::Exhausted)
            }
            FailureDisposition::CountAttempt => {
                let retry_at = self.retry_policy.next_retry_at(now, entry.attempts);
                debug!(entry_id = %entry.id, attempts = entry.attempts, retry_at = %retry_at, "send failed, retry scheduled");
                store
                    .mark_as_failed(entry.id, &error.to_string(), retry_at)
                    .await?;
                Ok(DeliveryOutcome::Failed)
            }
        }
    }
}

async fn worker_loop(
    pool: DeliveryWorkerPool,
    tenant_id: TenantId,
    worker: usize,
    config: Arc<DeliveryWorkerConfig>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(pool = %config.name, worker, tenant_id = %tenant_id, "delivery worker started");
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match pool
            .run_cycle(tenant_id, config.batch_size, config.fetch_timeout)
            .await
        {
            Ok(report) => {
                if let Ok(mut s) = stats.lock() {
                    s.record_cycle(&report);
                    s.uptime_secs = start_time.elapsed().as_secs();
                }
                report.claimed == 0
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(pool = %config.name, worker, tenant_id = %tenant_id, error = %e, "claim cycle failed");
                } else {
                    error!(pool = %config.name, worker, tenant_id = %tenant_id, error = %e, "claim cycle failed");
                }
                if let Ok(mut s) = stats.lock() {
                    s.cycle_errors += 1;
                }
                true
            }
        };

        if idle {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }

    info!(pool = %config.name, worker, tenant_id = %tenant_id, "delivery worker stopped");
}
