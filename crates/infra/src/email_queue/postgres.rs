//! Postgres-backed email queue.
//!
//! One `email_queue` table per tenant database. Claims rely on row-level
//! locking: candidate selection uses `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers receive disjoint batches without blocking each other, and the
//! single-entry claim is a conditional `UPDATE ... RETURNING` whose zero-row
//! result means another worker won.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | Database `23505` (unique violation) on insert | `AlreadyExists` |
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Connection` |
//! | Row decode failures | `Storage` |
//! | Anything else | `Storage` |
//!
//! ## Time
//!
//! "Now" comes from the injected [`Clock`] and is bound as a parameter instead
//! of using `NOW()`, so the database and the in-memory store evaluate
//! eligibility the same way.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use mailqueue_core::{Clock, EntryId, SystemClock};

use super::enqueue::{NewQueueEntry, prepare_batch};
use super::store::{EmailQueueStore, QueueError};
use super::types::{
    ClaimOutcome, ClaimedEntry, EntryStatus, QueueEntry, QueueStats, SourceType, stuck_timeout,
};

/// Table definition applied by [`PostgresEmailQueueStore::migrate`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS email_queue (
    id              UUID PRIMARY KEY,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'failed')),
    priority        INTEGER NOT NULL,
    source_type     TEXT NOT NULL,
    source_id       TEXT NOT NULL,
    integration_id  TEXT NOT NULL,
    provider_kind   TEXT NOT NULL,
    contact_email   TEXT NOT NULL,
    message_id      TEXT NOT NULL,
    template_id     TEXT NOT NULL,
    payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
    attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts    INTEGER NOT NULL DEFAULT 3 CHECK (max_attempts > 0),
    last_error      TEXT,
    next_retry_at   TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    processed_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_email_queue_claim
    ON email_queue (priority, created_at)
    WHERE status IN ('pending', 'failed', 'processing');

CREATE INDEX IF NOT EXISTS idx_email_queue_source
    ON email_queue (source_type, source_id, status);
"#;

const COLUMNS: &str = "id, status, priority, source_type, source_id, integration_id, \
    provider_kind, contact_email, message_id, template_id, payload, attempts, \
    max_attempts, last_error, next_retry_at, created_at, updated_at, processed_at";

/// Eligibility predicate. `$1` = now, `$2` = now minus the stuck timeout.
const ELIGIBLE: &str = "(status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)) \
    OR (status = 'failed' AND attempts < max_attempts AND next_retry_at <= $1) \
    OR (status = 'processing' AND updated_at < $2)";

/// Explicit claim predicate: anything not in flight, plus stuck entries.
/// `$2` = now minus the stuck timeout.
const CLAIMABLE: &str = "status IN ('pending', 'failed') \
    OR (status = 'processing' AND updated_at < $2)";

/// Postgres-backed email queue for a single tenant database.
///
/// `Send + Sync`; the SQLx pool handles connection sharing.
#[derive(Clone)]
pub struct PostgresEmailQueueStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PostgresEmailQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresEmailQueueStore").finish_non_exhaustive()
    }
}

impl PostgresEmailQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }

    /// Create the queue table and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    fn claim_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.clock.now();
        (now, now - stuck_timeout())
    }

    /// Conditional single-row claim. `predicate` may use `$1` (now) and `$2`
    /// (stuck cutoff). A locked or non-matching row is a lost race.
    async fn claim_one(
        &self,
        id: EntryId,
        predicate: &str,
        operation: &str,
    ) -> Result<ClaimOutcome, QueueError> {
        let (now, stuck_before) = self.claim_window();

        let row = sqlx::query(&format!(
            "WITH target AS ( \
                 SELECT id, status AS previous_status FROM email_queue \
                 WHERE id = $3 AND ({predicate}) \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE email_queue AS q \
             SET status = 'processing', attempts = q.attempts + 1, updated_at = $1 \
             FROM target \
             WHERE q.id = target.id \
             RETURNING {}, target.previous_status",
            qualified_columns("q")
        ))
        .bind(now)
        .bind(stuck_before)
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => Ok(ClaimOutcome::Claimed(decode_claim(&row)?)),
            None => Ok(ClaimOutcome::Lost),
        }
    }
}

#[async_trait]
impl EmailQueueStore for PostgresEmailQueueStore {
    #[instrument(skip(self, entries), fields(entry_count = entries.len()), err)]
    async fn enqueue(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<EntryId>, QueueError> {
        if entries.is_empty() {
            return Ok(vec![]);
        }

        let rows = prepare_batch(entries, self.clock.now())?;

        // Dropping the transaction without commit rolls everything back.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query(&format!(
                "INSERT INTO email_queue ({COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
            ))
            .bind(row.id.as_uuid())
            .bind(row.status.as_str())
            .bind(row.priority)
            .bind(row.source_type.as_str())
            .bind(&row.source_id)
            .bind(&row.integration_id)
            .bind(row.provider_kind.as_str())
            .bind(&row.contact_email)
            .bind(&row.message_id)
            .bind(&row.template_id)
            .bind(&row.payload)
            .bind(to_db_int(row.attempts, "attempts")?)
            .bind(to_db_int(row.max_attempts, "max_attempts")?)
            .bind(&row.last_error)
            .bind(row.next_retry_at)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.processed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    QueueError::AlreadyExists(row.id)
                } else {
                    map_sqlx_error("insert_entry", e)
                }
            })?;
            ids.push(row.id);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(ids)
    }

    #[instrument(skip(self), fields(returned = tracing::field::Empty), err)]
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let (now, stuck_before) = self.claim_window();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_queue \
             WHERE {ELIGIBLE} \
             ORDER BY priority ASC, created_at ASC, id ASC \
             LIMIT $3 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .bind(stuck_before)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_pending", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let entries = decode_rows(rows)?;
        Span::current().record("returned", entries.len());
        Ok(entries)
    }

    #[instrument(skip(self, id), fields(entry_id = %id), err)]
    async fn mark_as_processing(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        self.claim_one(id, CLAIMABLE, "mark_as_processing").await
    }

    #[instrument(skip(self, id), fields(entry_id = %id), err)]
    async fn try_claim_eligible(&self, id: EntryId) -> Result<ClaimOutcome, QueueError> {
        self.claim_one(id, ELIGIBLE, "try_claim_eligible").await
    }

    /// Select-and-claim in one statement; rows locked by another in-flight
    /// claim are skipped rather than waited on.
    #[instrument(skip(self), fields(claimed = tracing::field::Empty), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedEntry>, QueueError> {
        let (now, stuck_before) = self.claim_window();

        let rows = sqlx::query(&format!(
            "UPDATE email_queue AS q \
             SET status = 'processing', attempts = q.attempts + 1, updated_at = $1 \
             FROM ( \
                 SELECT id, status AS previous_status FROM email_queue \
                 WHERE {ELIGIBLE} \
                 ORDER BY priority ASC, created_at ASC, id ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) AS candidates \
             WHERE q.id = candidates.id \
             RETURNING {}, candidates.previous_status",
            qualified_columns("q")
        ))
        .bind(now)
        .bind(stuck_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut claimed = rows
            .iter()
            .map(decode_claim)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|c| c.entry.claim_order());
        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, id), fields(entry_id = %id), err)]
    async fn mark_as_sent(&self, id: EntryId) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM email_queue WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_as_sent", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, id, error), fields(entry_id = %id), err)]
    async fn mark_as_failed(
        &self,
        id: EntryId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let now = self.clock.now();
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'failed',
                last_error = $2,
                next_retry_at = $3,
                updated_at = $4,
                processed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_as_failed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, id), fields(entry_id = %id), err)]
    async fn set_next_retry(&self, id: EntryId, at: DateTime<Utc>) -> Result<u64, QueueError> {
        // attempts is deliberately absent from the SET list.
        let result = sqlx::query(
            r#"
            UPDATE email_queue
            SET status = 'pending',
                next_retry_at = $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_next_retry", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, id), fields(entry_id = %id), err)]
    async fn delete(&self, id: EntryId) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM email_queue WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, QueueError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM email_queue WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM email_queue GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("get_stats", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("get_stats", e))?;
            let total = total.max(0) as u64;
            match status
                .parse::<EntryStatus>()
                .map_err(|e| QueueError::Storage(e.to_string()))?
            {
                EntryStatus::Pending => stats.pending = total,
                EntryStatus::Processing => stats.processing = total,
                EntryStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }

    async fn get_by_source_id(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM email_queue \
             WHERE source_type = $1 AND source_id = $2 \
             ORDER BY priority ASC, created_at ASC, id ASC"
        ))
        .bind(source_type.as_str())
        .bind(source_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_source_id", e))?;

        decode_rows(rows)
    }

    async fn count_by_source_and_status(
        &self,
        source_type: SourceType,
        source_id: &str,
        status: EntryStatus,
    ) -> Result<u64, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM email_queue
            WHERE source_type = $1 AND source_id = $2 AND status = $3
            "#,
        )
        .bind(source_type.as_str())
        .bind(source_id)
        .bind(status.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_source_and_status", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count_by_source_and_status", e))?;
        Ok(total.max(0) as u64)
    }
}

fn to_db_int(value: u32, column: &str) -> Result<i32, QueueError> {
    i32::try_from(value)
        .map_err(|_| QueueError::Validation(format!("{column} = {value} does not fit the column")))
}

fn qualified_columns(alias: &str) -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::PoolClosed => {
            QueueError::Connection(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::Connection(format!("timed out acquiring a connection in {operation}"))
        }
        sqlx::Error::Io(e) => QueueError::Connection(format!("i/o error in {operation}: {e}")),
        sqlx::Error::Tls(e) => QueueError::Connection(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => QueueError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => QueueError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct QueueEntryRow {
    id: uuid::Uuid,
    status: String,
    priority: i32,
    source_type: String,
    source_id: String,
    integration_id: String,
    provider_kind: String,
    contact_email: String,
    message_id: String,
    template_id: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for QueueEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueEntryRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            source_type: row.try_get("source_type")?,
            source_id: row.try_get("source_id")?,
            integration_id: row.try_get("integration_id")?,
            provider_kind: row.try_get("provider_kind")?,
            contact_email: row.try_get("contact_email")?,
            message_id: row.try_get("message_id")?,
            template_id: row.try_get("template_id")?,
            payload: row.try_get("payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = QueueError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let invalid = move |e: mailqueue_core::DomainError| {
            QueueError::Storage(format!("invalid email_queue row {id}: {e}"))
        };

        Ok(QueueEntry {
            id: EntryId::from_uuid(id),
            status: row.status.parse().map_err(invalid)?,
            priority: row.priority,
            source_type: row.source_type.parse().map_err(invalid)?,
            source_id: row.source_id,
            integration_id: row.integration_id,
            provider_kind: row.provider_kind.parse().map_err(invalid)?,
            contact_email: row.contact_email,
            message_id: row.message_id,
            template_id: row.template_id,
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
        })
    }
}

fn decode_row(row: &PgRow) -> Result<QueueEntry, QueueError> {
    QueueEntryRow::from_row(row)
        .map_err(|e| QueueError::Storage(format!("failed to deserialize queue row: {e}")))?
        .try_into()
}

fn decode_claim(row: &PgRow) -> Result<ClaimedEntry, QueueError> {
    let previous_status: String = row
        .try_get("previous_status")
        .map_err(|e| QueueError::Storage(format!("failed to deserialize claim row: {e}")))?;
    Ok(ClaimedEntry {
        entry: decode_row(row)?,
        previous_status: previous_status
            .parse()
            .map_err(|e: mailqueue_core::DomainError| QueueError::Storage(e.to_string()))?,
    })
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<QueueEntry>, QueueError> {
    rows.iter().map(decode_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_every_column() {
        let qualified = qualified_columns("q");
        assert_eq!(qualified.split(", ").count(), COLUMNS.split(',').count());
        assert!(qualified.starts_with("q.id, q.status"));
        assert!(qualified.ends_with("q.processed_at"));
    }

    #[test]
    fn connection_failures_are_classified() {
        assert!(matches!(
            map_sqlx_error("fetch_pending", sqlx::Error::PoolClosed),
            QueueError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error("fetch_pending", sqlx::Error::PoolTimedOut),
            QueueError::Connection(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::RowNotFound),
            QueueError::Storage(_)
        ));
    }

    #[test]
    fn oversized_counters_are_rejected() {
        assert_eq!(to_db_int(3, "max_attempts"), Ok(3));
        assert!(matches!(
            to_db_int(u32::MAX, "max_attempts"),
            Err(QueueError::Validation(_))
        ));
    }

    #[test]
    fn schema_constrains_status_values() {
        assert!(SCHEMA.contains("CHECK (status IN ('pending', 'processing', 'failed'))"));
    }
}
