//! Infrastructure layer: email queue stores, tenant routing, delivery workers, config.

pub mod config;
pub mod email_queue;
pub mod tenant;

pub use config::{ConfigError, QueueConfig};
pub use tenant::{ConnectionResolver, InMemoryConnectionResolver, PostgresConnectionResolver};
