//! Tenant routing: maps a tenant to the store holding its queue.
//!
//! Queue logic never looks at tenant ids; workers ask a resolver for the
//! tenant's store at the start of every polling cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};

use mailqueue_core::{Clock, SystemClock, TenantId};

use crate::email_queue::{EmailQueueStore, InMemoryEmailQueueStore, PostgresEmailQueueStore, QueueError};

/// Placeholder substituted with the tenant id in database URL templates.
pub const TENANT_PLACEHOLDER: &str = "{tenant_id}";

/// Resolves a tenant to its queue store.
#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    /// Fails with [`QueueError::Connection`] when the tenant's storage is
    /// unreachable.
    async fn resolve(&self, tenant_id: TenantId) -> Result<Arc<dyn EmailQueueStore>, QueueError>;
}

#[async_trait]
impl<R> ConnectionResolver for Arc<R>
where
    R: ConnectionResolver + ?Sized,
{
    async fn resolve(&self, tenant_id: TenantId) -> Result<Arc<dyn EmailQueueStore>, QueueError> {
        (**self).resolve(tenant_id).await
    }
}

/// One in-memory store per tenant, created on first use, for tests/dev.
pub struct InMemoryConnectionResolver {
    stores: Mutex<HashMap<TenantId, Arc<InMemoryEmailQueueStore>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryConnectionResolver {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// All stores created by this resolver share `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// The tenant's store, created if needed.
    pub fn store_for(&self, tenant_id: TenantId) -> Result<Arc<InMemoryEmailQueueStore>, QueueError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))?;
        let store = stores.entry(tenant_id).or_insert_with(|| {
            debug!(tenant_id = %tenant_id, "creating in-memory email queue");
            Arc::new(InMemoryEmailQueueStore::with_clock(self.clock.clone()))
        });
        Ok(store.clone())
    }
}

impl Default for InMemoryConnectionResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionResolver for InMemoryConnectionResolver {
    async fn resolve(&self, tenant_id: TenantId) -> Result<Arc<dyn EmailQueueStore>, QueueError> {
        let store: Arc<dyn EmailQueueStore> = self.store_for(tenant_id)?;
        Ok(store)
    }
}

/// Postgres resolver: one database (and one cached pool) per tenant.
///
/// The database URL is derived from a template such as
/// `postgres://mail:secret@db/tenant_{tenant_id}`.
pub struct PostgresConnectionResolver {
    url_template: String,
    max_connections: u32,
    acquire_timeout: Duration,
    clock: Arc<dyn Clock>,
    stores: tokio::sync::Mutex<HashMap<TenantId, Arc<PostgresEmailQueueStore>>>,
}

impl PostgresConnectionResolver {
    pub fn new(url_template: impl Into<String>, max_connections: u32) -> Self {
        Self {
            url_template: url_template.into(),
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
            stores: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Database URL for a tenant.
    pub fn database_url(&self, tenant_id: TenantId) -> String {
        self.url_template
            .replace(TENANT_PLACEHOLDER, &tenant_id.as_uuid().simple().to_string())
    }
}

#[async_trait]
impl ConnectionResolver for PostgresConnectionResolver {
    async fn resolve(&self, tenant_id: TenantId) -> Result<Arc<dyn EmailQueueStore>, QueueError> {
        // Held across connect so concurrent workers of one tenant share a pool.
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&tenant_id) {
            let store: Arc<dyn EmailQueueStore> = store.clone();
            return Ok(store);
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.database_url(tenant_id))
            .await
            .map_err(|e| {
                QueueError::Connection(format!("tenant {tenant_id}: failed to connect: {e}"))
            })?;

        info!(tenant_id = %tenant_id, max_connections = self.max_connections, "connected tenant email queue");

        let store = Arc::new(PostgresEmailQueueStore::with_clock(pool, self.clock.clone()));
        stores.insert(tenant_id, store.clone());
        let store: Arc<dyn EmailQueueStore> = store;
        Ok(store)
    }
}
