use std::sync::Arc;
use std::time::Duration;

use sluice::application::repos::{CountersRepo, RelationsRepo};
use sluice::cache::{CacheConfig, CacheEngine, Count, FlushReport, MemoryStore};
use sluice::domain::types::{CounterKey, CounterKind, Relation, RelationKind};
use sluice::infra::memory::MemoryRepositories;

fn seeded() -> Arc<MemoryRepositories> {
    let durable = Arc::new(MemoryRepositories::new());
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        durable.insert_user(id, name);
    }
    durable.insert_video(7, 2, "sunset");
    durable
}

fn engine(durable: Arc<MemoryRepositories>) -> CacheEngine {
    CacheEngine::new(
        CacheConfig::default(),
        Arc::new(MemoryStore::new()),
        durable,
    )
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_what_is_still_queued() {
    let durable = seeded();
    let engine = engine(durable.clone());
    engine.start();
    assert!(engine.is_running());

    engine
        .set_relation(RelationKind::Follow, 1, 2, true)
        .await
        .expect("follow");
    engine
        .set_relation(RelationKind::Follow, 3, 2, true)
        .await
        .expect("follow");
    assert_eq!(engine.pending_writes(), 2);

    let report = engine.stop().await;
    assert!(!engine.is_running());
    assert_eq!(report.succeeded, 2);
    assert_eq!(engine.pending_writes(), 0);
    assert_eq!(durable.relation_rows(RelationKind::Follow), 2);
}

#[tokio::test(start_paused = true)]
async fn ticks_collapse_flapping_state_into_one_write() {
    let durable = seeded();
    let engine = engine(durable.clone());
    engine.start();

    for desired in [true, false, true, false, true] {
        engine
            .set_relation(RelationKind::Favorite, 1, 7, desired)
            .await
            .expect("toggle");
    }
    tokio::time::sleep(engine.config().sync_interval + Duration::from_millis(1)).await;

    assert_eq!(engine.pending_writes(), 0);
    assert_eq!(durable.relation_rows(RelationKind::Favorite), 1);
    let favorited = durable
        .read_aggregate_count(CounterKey::new(CounterKind::VideoFavorited, 7))
        .await
        .expect("column");
    assert_eq!(favorited, 1);

    engine.stop().await;
}

#[tokio::test]
async fn failed_flush_is_not_retried() {
    let durable = seeded();
    let engine = engine(durable.clone());

    engine
        .set_relation(RelationKind::Follow, 1, 3, true)
        .await
        .expect("follow");
    durable.set_unavailable(true);

    let report = engine.flush().await;
    assert_eq!(report.drained, 1);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.deficit(), 1);
    assert_eq!(engine.pending_writes(), 0);

    durable.set_unavailable(false);
    assert_eq!(engine.flush().await, FlushReport::default());
    let follow = Relation::follow(1, 3).expect("relation");
    assert!(!durable.relation_exists(follow).await.expect("exists"));
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn counters_refresh_from_durable_once_the_pinned_ttl_lapses() {
    let durable = seeded();
    let engine = engine(durable.clone());
    let followers = CounterKey::new(CounterKind::UserFollowers, 2);
    assert_eq!(engine.get_count(followers).await, Count::Value(0));

    engine
        .set_relation(RelationKind::Follow, 1, 2, true)
        .await
        .expect("follow");
    assert_eq!(engine.get_count(followers).await, Count::Value(1));

    // The durable column drifts ahead of the cache; the pinned TTL bounds how
    // long the cached value survives.
    durable.set_count(followers, 10);
    let report = engine.flush().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(engine.get_count(followers).await, Count::Value(1));

    tokio::time::sleep(engine.config().ledger_ttl() + Duration::from_millis(1)).await;
    assert_eq!(engine.get_count(followers).await, Count::Value(11));
    engine.stop().await;
}
