//! Shared building blocks for the email delivery queue: ids, clock, domain errors.
//!
//! This crate contains **pure** primitives (no storage or runtime concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{EntryId, TenantId};
