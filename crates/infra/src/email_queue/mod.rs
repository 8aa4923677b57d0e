//! Multi-tenant email delivery queue.
//!
//! ## Design
//!
//! - One queue per tenant; a `ConnectionResolver` picks the tenant's store
//! - Priority tiers, FIFO within a tier
//! - Exclusive claims enforced by the storage engine, safe across processes
//! - Failed attempts are counted against a per-entry budget
//! - Entries stuck in `processing` become claimable again after a timeout
//! - Sent entries are deleted; the queue only holds outstanding work
//!
//! ## Components
//!
//! - `QueueEntry`: one scheduled email and its delivery state
//! - `EmailQueueStore`: persistence (in-memory or Postgres)
//! - `DeliveryWorkerPool`: claims, sends and records outcomes

pub mod enqueue;
pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use enqueue::{MAX_ATTEMPTS_LIMIT, NewQueueEntry};
pub use in_memory::InMemoryEmailQueueStore;
pub use postgres::PostgresEmailQueueStore;
pub use store::{EmailQueueStore, QueueError};
pub use types::{
    BackoffStrategy, ClaimOutcome, ClaimedEntry, DEFAULT_MAX_ATTEMPTS, EntryStatus,
    PRIORITY_AUTOMATION, PRIORITY_BROADCAST, PRIORITY_TRANSACTIONAL, ProviderKind, QueueEntry,
    QueueStats, RetryPolicy, STUCK_TIMEOUT, SourceType, stuck_timeout,
};
pub use worker::{
    CircuitBreaker, CycleReport, DeliveryOutcome, DeliveryWorkerConfig, DeliveryWorkerHandle,
    DeliveryWorkerPool, EmailSender, FailureDisposition, NoopCircuitBreaker, SendError,
    WorkerStats,
};
