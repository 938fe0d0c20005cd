use std::sync::Arc;
use std::time::Duration;

use sluice::cache::{
    CacheConfig, CacheEngine, CacheError, CacheStore, CacheValue, CeilingCheck, Count,
    MemoryStore,
};
use sluice::domain::entities::{Entity, UserSnapshot};
use sluice::domain::types::{CounterKey, CounterKind, EntityKind, EntityRef};
use sluice::infra::memory::MemoryRepositories;

struct Harness {
    store: Arc<MemoryStore>,
    durable: Arc<MemoryRepositories>,
    engine: CacheEngine,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let durable = Arc::new(MemoryRepositories::new());
    durable.insert_user(1, "alice");
    durable.insert_user(2, "bob");
    durable.insert_video(7, 2, "sunset");
    let engine = CacheEngine::new(CacheConfig::default(), store.clone(), durable.clone());
    Harness {
        store,
        durable,
        engine,
    }
}

#[test]
fn negative_ttl_is_shorter_than_every_positive_ttl() {
    let config = CacheConfig::default();
    for _ in 0..100 {
        assert!(config.negative_ttl() < config.positive_ttl());
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_count_is_distinct_from_zero_until_the_placeholder_expires() {
    let h = harness();
    let works = CounterKey::new(CounterKind::UserWorks, 5);

    assert_eq!(h.engine.get_count(works).await, Count::Unknown);
    assert_eq!(
        h.store.get("user:wrk:count:5").await.expect("raw"),
        Some(CacheValue::Empty)
    );

    h.durable.insert_user(5, "eve");
    assert_eq!(h.engine.get_count(works).await, Count::Unknown);

    tokio::time::sleep(h.engine.config().negative_ttl() + Duration::from_millis(1)).await;
    assert_eq!(h.engine.get_count(works).await, Count::Value(0));
}

#[tokio::test(start_paused = true)]
async fn invalidated_count_reloads_the_durable_value() {
    let h = harness();
    let works = CounterKey::new(CounterKind::UserWorks, 2);
    assert_eq!(h.engine.get_count(works).await, Count::Value(1));

    h.durable.insert_video(8, 2, "sunrise");
    assert_eq!(h.engine.get_count(works).await, Count::Value(1));

    h.engine.invalidate_count(works).await.expect("invalidate");
    assert_eq!(h.engine.pending_tasks(), 1);
    assert_eq!(h.engine.get_count(works).await, Count::Value(2));

    tokio::time::sleep(h.engine.config().max_rw_time + Duration::from_millis(1)).await;
    h.engine.settle().await;
    assert_eq!(h.store.get("user:wrk:count:2").await.expect("raw"), None);
}

#[tokio::test]
async fn snapshot_is_cached_until_invalidated() {
    let h = harness();
    let alice = EntityRef::user(1);

    let first = h.engine.get_snapshot(alice).await.expect("snapshot");
    assert!(matches!(&first, Entity::User(user) if user.username == "alice"));

    assert!(h.durable.rename_user(1, "alicia"));
    let cached = h.engine.get_snapshot(alice).await.expect("snapshot");
    assert_eq!(cached, first);

    h.engine.invalidate_snapshot(alice).await.expect("invalidate");
    let fresh = h.engine.get_snapshot(alice).await.expect("snapshot");
    assert!(matches!(fresh, Entity::User(user) if user.username == "alicia"));
    h.engine.stop().await;
}

#[tokio::test]
async fn put_snapshot_replaces_cached_state() {
    let h = harness();
    let replacement = Entity::User(UserSnapshot {
        id: 2,
        username: "robert".to_string(),
        signature: "hello".to_string(),
        created_at: 1_700_000_000,
        updated_at: 1_700_000_500,
    });

    h.engine
        .put_snapshot(&replacement, Duration::from_secs(60))
        .await
        .expect("put");
    assert_eq!(
        h.engine.get_snapshot(EntityRef::user(2)).await.expect("get"),
        replacement
    );
}

#[tokio::test]
async fn missing_snapshot_is_negatively_cached() {
    let h = harness();
    let ghost = EntityRef::video(404);

    assert!(matches!(
        h.engine.get_snapshot(ghost).await,
        Err(CacheError::NotFound { .. })
    ));
    assert!(matches!(
        h.engine.get_snapshot(ghost).await,
        Err(CacheError::NegativeCacheHit { .. })
    ));
}

#[tokio::test]
async fn ceilings_bound_ids_after_refresh() {
    let h = harness();
    assert_eq!(
        h.engine.check_ceiling(EntityKind::Video, 7).await,
        CeilingCheck::Unknown
    );

    let report = h.engine.refresh_ceilings().await;
    assert!(report.is_complete(), "{report}");
    assert_eq!(
        h.engine.check_ceiling(EntityKind::Video, 7).await,
        CeilingCheck::WithinBound
    );
    assert_eq!(
        h.engine.check_ceiling(EntityKind::Video, 8).await,
        CeilingCheck::OutOfBound
    );

    h.engine
        .note_created(EntityKind::Video, 8)
        .await
        .expect("note created");
    assert_eq!(
        h.engine.check_ceiling(EntityKind::Video, 8).await,
        CeilingCheck::WithinBound
    );
}

#[tokio::test]
async fn refresh_tolerates_an_unavailable_durable_store() {
    let h = harness();
    h.durable.set_unavailable(true);

    let report = h.engine.refresh_ceilings().await;
    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), EntityKind::ALL.len());
    assert_eq!(
        h.engine.check_ceiling(EntityKind::User, 1).await,
        CeilingCheck::Unknown
    );
}
