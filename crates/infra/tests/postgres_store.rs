//! Postgres store tests. Skipped unless `DATABASE_URL` points at a scratch database.
//!
//! Each test works in its own schema so tests can run in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use mailqueue_core::{Clock, ManualClock};
use mailqueue_infra::email_queue::{
    ClaimOutcome, EmailQueueStore, EntryStatus, NewQueueEntry, PRIORITY_TRANSACTIONAL,
    PostgresEmailQueueStore, ProviderKind, QueueError, SourceType, stuck_timeout,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;

async fn store() -> Option<(Arc<ManualClock>, Arc<PostgresEmailQueueStore>)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let schema = format!("mq_test_{}", uuid::Uuid::now_v7().simple());
    let admin = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
    admin
        .execute(format!("CREATE SCHEMA {schema}").as_str())
        .await
        .unwrap();

    let search_path = format!("SET search_path TO {schema}");
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                conn.execute(search_path.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();

    let clock = ManualClock::arc(chrono::Utc::now());
    let store = PostgresEmailQueueStore::with_clock(pool, clock.clone());
    store.migrate().await.unwrap();
    Some((clock, Arc::new(store)))
}

fn entry(source_id: &str, email: &str) -> NewQueueEntry {
    NewQueueEntry::new(
        SourceType::Broadcast,
        source_id,
        "int-1",
        ProviderKind::Smtp,
        email,
        format!("msg-{email}"),
        "tpl-1",
    )
}

#[tokio::test]
async fn round_trips_entries_in_claim_order() {
    let Some((_clock, store)) = store().await else {
        return;
    };

    let ids = store
        .enqueue(vec![
            entry("bc-1", "five@example.com").with_priority(5),
            entry("bc-1", "one@example.com")
                .with_priority(PRIORITY_TRANSACTIONAL)
                .with_raw_payload(serde_json::json!({"first_name": "Ada"})),
            entry("bc-1", "three@example.com").with_priority(3),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let fetched = store.fetch_pending(3).await.unwrap();
    assert_eq!(fetched.iter().map(|e| e.priority).collect::<Vec<_>>(), vec![1, 3, 5]);
    assert_eq!(fetched[0].payload["first_name"], "Ada");
    assert_eq!(fetched[0].status, EntryStatus::Pending);
    assert_eq!(fetched[0].attempts, 0);

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.pending, 3);
}

#[tokio::test]
async fn duplicate_id_rolls_back_the_batch() {
    let Some((_clock, store)) = store().await else {
        return;
    };

    let id = store.enqueue(vec![entry("bc-1", "ada@example.com")]).await.unwrap()[0];

    let err = store
        .enqueue(vec![
            entry("bc-1", "grace@example.com"),
            entry("bc-1", "linus@example.com").with_id(id),
        ])
        .await
        .unwrap_err();
    assert_eq!(err, QueueError::AlreadyExists(id));
    assert_eq!(store.get_stats().await.unwrap().pending, 1);
}

#[tokio::test]
async fn claim_fail_and_recover_lifecycle() {
    let Some((clock, store)) = store().await else {
        return;
    };

    let id = store.enqueue(vec![entry("bc-2", "ada@example.com")]).await.unwrap()[0];

    let claimed = store.mark_as_processing(id).await.unwrap().into_entry().unwrap();
    assert_eq!(claimed.attempts, 1);
    assert_eq!(store.mark_as_processing(id).await.unwrap(), ClaimOutcome::Lost);

    let retry_at = clock.now() + Duration::minutes(5);
    assert_eq!(store.mark_as_failed(id, "smtp timeout", retry_at).await.unwrap(), 1);
    assert!(store.fetch_pending(10).await.unwrap().is_empty());

    clock.advance(Duration::minutes(5) + Duration::seconds(1));
    let claimed = store.claim_batch(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].entry.attempts, 2);
    assert_eq!(claimed[0].previous_status, EntryStatus::Failed);

    // Worker dies; the claim is recovered after the stuck timeout.
    clock.advance(stuck_timeout() + Duration::seconds(1));
    let fetched = store.fetch_pending(10).await.unwrap();
    assert_eq!(fetched.iter().map(|e| e.id).collect::<Vec<_>>(), vec![id]);
    let reclaimed = store.try_claim_eligible(id).await.unwrap().into_claim().unwrap();
    assert!(reclaimed.is_reclaim());
    assert_eq!(reclaimed.entry.attempts, 3);

    let at = clock.now() + Duration::minutes(1);
    assert_eq!(store.set_next_retry(id, at).await.unwrap(), 1);
    let rescheduled = store.get(id).await.unwrap().unwrap();
    assert_eq!(rescheduled.status, EntryStatus::Pending);
    assert_eq!(rescheduled.attempts, 3);

    assert_eq!(
        store
            .count_by_source_and_status(SourceType::Broadcast, "bc-2", EntryStatus::Pending)
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.mark_as_sent(id).await.unwrap(), 1);
    assert_eq!(store.mark_as_sent(id).await.unwrap(), 0);
    assert!(
        store
            .get_by_source_id(SourceType::Broadcast, "bc-2")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batch_claims_are_disjoint() {
    let Some((_clock, store)) = store().await else {
        return;
    };

    let ids: HashSet<_> = store
        .enqueue(
            (0..60)
                .map(|i| entry("bc-3", &format!("user{i}@example.com")))
                .collect(),
        )
        .await
        .unwrap()
        .into_iter()
        .collect();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut won = Vec::new();
            loop {
                let batch = store.claim_batch(5).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                won.extend(batch.into_iter().map(|c| c.entry.id));
            }
            won
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    assert_eq!(all.len(), ids.len());
    assert_eq!(all.into_iter().collect::<HashSet<_>>(), ids);
}
