//! Claim exclusivity under concurrency, plus queue accounting properties.

use std::collections::HashSet;
use std::sync::Arc;

use mailqueue_core::EntryId;
use mailqueue_infra::email_queue::{
    ClaimOutcome, EmailQueueStore, InMemoryEmailQueueStore, NewQueueEntry, ProviderKind,
    SourceType,
};
use proptest::prelude::*;

fn entry(i: usize) -> NewQueueEntry {
    NewQueueEntry::new(
        SourceType::Broadcast,
        "bc-1",
        "int-1",
        ProviderKind::Smtp,
        format!("user{i}@example.com"),
        format!("msg-{i}"),
        "tpl-1",
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_single_claims_never_overlap() {
    let store = InMemoryEmailQueueStore::arc();
    let ids = store
        .enqueue((0..64).map(entry).collect())
        .await
        .unwrap();
    let candidates = store.fetch_pending(64).await.unwrap();
    assert_eq!(candidates.len(), 64);

    // Every worker races for every candidate.
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let candidates: Vec<EntryId> = candidates.iter().map(|e| e.id).collect();
        tasks.push(tokio::spawn(async move {
            let mut won = Vec::new();
            for id in candidates {
                if let ClaimOutcome::Claimed(claim) = store.mark_as_processing(id).await.unwrap() {
                    assert_eq!(claim.entry.attempts, 1);
                    won.push(id);
                }
            }
            won
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "an entry was claimed twice");
    assert_eq!(unique, ids.into_iter().collect::<HashSet<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batch_claims_are_disjoint() {
    let store = InMemoryEmailQueueStore::arc();
    let ids = store
        .enqueue((0..100).map(entry).collect())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store: Arc<InMemoryEmailQueueStore> = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut won = Vec::new();
            loop {
                let batch = store.claim_batch(7).await.unwrap();
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
    assert_eq!(
        all.into_iter().collect::<HashSet<_>>(),
        ids.into_iter().collect::<HashSet<_>>()
    );
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn enqueue_grows_pending_by_batch_size(batches in prop::collection::vec(0usize..20, 1..6)) {
        let rt = runtime();
        let store = InMemoryEmailQueueStore::new();
        let mut expected = 0u64;
        let mut next = 0usize;

        for size in batches {
            let before = rt.block_on(store.get_stats()).unwrap().pending;
            let batch: Vec<_> = (next..next + size).map(entry).collect();
            next += size;

            let ids = rt.block_on(store.enqueue(batch)).unwrap();
            prop_assert_eq!(ids.len(), size);

            let after = rt.block_on(store.get_stats()).unwrap().pending;
            prop_assert_eq!(after - before, size as u64);
            expected += size as u64;
        }

        prop_assert_eq!(rt.block_on(store.get_stats()).unwrap().pending, expected);
    }

    #[test]
    fn only_claims_charge_attempts(ops in prop::collection::vec(any::<bool>(), 1..30)) {
        // true = claim and fail immediately, false = voluntary reschedule
        let rt = runtime();
        let store = InMemoryEmailQueueStore::new();
        let id = rt
            .block_on(store.enqueue(vec![entry(0).with_max_attempts(1_000)]))
            .unwrap()[0];
        let mut claims = 0u32;

        for claim in ops {
            let now = chrono::Utc::now() - chrono::Duration::seconds(1);
            if claim {
                let outcome = rt.block_on(store.mark_as_processing(id)).unwrap();
                prop_assert!(outcome.is_claimed());
                claims += 1;
                prop_assert_eq!(rt.block_on(store.mark_as_failed(id, "boom", now)).unwrap(), 1);
            } else {
                prop_assert_eq!(rt.block_on(store.set_next_retry(id, now)).unwrap(), 1);
            }
            let stored = rt.block_on(store.get(id)).unwrap().unwrap();
            prop_assert_eq!(stored.attempts, claims);
        }
    }
}
