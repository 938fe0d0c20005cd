//! Entity snapshot cache.
//!
//! Snapshots are stored as field hashes. Reads run under a watch so a
//! concurrent [`SnapshotCache::put`] is never observed half-applied. A miss
//! claims the key with a loading marker before reading the durable store; the
//! negative placeholder is written only once the entity is confirmed absent.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, warn};

use crate::application::repos::DurableStore;
use crate::domain::entities::Entity;
use crate::domain::error::DomainError;
use crate::domain::types::EntityRef;

use super::config::{CacheConfig, MAX_WATCH_RETRIES};
use super::counter::METRIC_NEGATIVE_CACHE_HIT;
use super::error::CacheError;
use super::keys::CacheKey;
use super::store::{CacheStore, CacheValue, Pipeline, StoreError, Version};
use super::tasks::DelayedTasks;

pub(super) const METRIC_LOCK_CONFLICT: &str = "sluice_lock_conflict_total";

/// Raw state of a snapshot key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedSnapshot {
    Present(Entity),
    /// Negative-cache placeholder.
    Absent,
    /// Another reader holds the load claim.
    Loading,
    Missing,
}

pub struct SnapshotCache {
    store: Arc<dyn CacheStore>,
    durable: Arc<dyn DurableStore>,
    tasks: Arc<DelayedTasks>,
    config: CacheConfig,
}

impl SnapshotCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        durable: Arc<dyn DurableStore>,
        tasks: Arc<DelayedTasks>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            durable,
            tasks,
            config,
        }
    }

    pub fn key(entity: EntityRef) -> String {
        CacheKey::snapshot(entity.kind, entity.id).to_string()
    }

    /// Read-through lookup.
    ///
    /// Fails with [`CacheError::NegativeCacheHit`] while the entity is cached
    /// as absent and with [`CacheError::TransientLockConflict`] once the watched
    /// read keeps conflicting; callers may then go to the durable store.
    pub async fn get(&self, entity: EntityRef) -> Result<Entity, CacheError> {
        let key = Self::key(entity);
        let (cached, version) = self.read_consistent(entity, &key).await?;
        match cached {
            CachedSnapshot::Present(found) => return Ok(found),
            CachedSnapshot::Absent => {
                counter!(METRIC_NEGATIVE_CACHE_HIT, "family" => "snapshot").increment(1);
                return Err(CacheError::NegativeCacheHit { key });
            }
            CachedSnapshot::Loading => {
                debug!(entity = %entity, "Snapshot load in flight, reading durable store");
                return self
                    .durable
                    .read_entity(entity)
                    .await?
                    .ok_or(CacheError::NotFound { entity });
            }
            CachedSnapshot::Missing => {}
        }

        let claim = Pipeline::new().set_ex(&key, CacheValue::Loading, self.config.max_rw_time);
        let claimed = match self
            .store
            .exec_watched(&[(key.clone(), version)], claim)
            .await
        {
            Ok(()) => Some(self.store.watch(&key).await?),
            Err(StoreError::Conflict) => {
                debug!(entity = %entity, "Snapshot load already claimed, reading durable store");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let loaded = match self.durable.read_entity(entity).await {
            Ok(loaded) => loaded,
            Err(err) => {
                if let Some(claimed) = claimed {
                    self.settle_claim(&key, claimed, Pipeline::new().delete(&key))
                        .await;
                }
                return Err(err.into());
            }
        };

        let Some(claimed) = claimed else {
            return loaded.ok_or(CacheError::NotFound { entity });
        };
        match loaded {
            Some(loaded) => {
                let fill = Pipeline::new().set_ex(
                    &key,
                    CacheValue::Hash(loaded.to_fields()?),
                    self.config.positive_ttl(),
                );
                self.settle_claim(&key, claimed, fill).await;
                Ok(loaded)
            }
            None => {
                let absent =
                    Pipeline::new().set_ex(&key, CacheValue::Empty, self.config.negative_ttl());
                self.settle_claim(&key, claimed, absent).await;
                Err(CacheError::NotFound { entity })
            }
        }
    }

    /// Replace our load claim with `pipeline` unless someone wrote the key since.
    async fn settle_claim(&self, key: &str, claimed: Version, pipeline: Pipeline) {
        match self
            .store
            .exec_watched(&[(key.to_string(), claimed)], pipeline)
            .await
        {
            Ok(()) | Err(StoreError::Conflict) => {}
            Err(err) => warn!(key = %key, error = %err, "Snapshot claim update failed"),
        }
    }

    /// Watched read retried up to [`MAX_WATCH_RETRIES`] times.
    async fn read_consistent(
        &self,
        entity: EntityRef,
        key: &str,
    ) -> Result<(CachedSnapshot, Version), CacheError> {
        for attempt in 1..=MAX_WATCH_RETRIES {
            let version = self.store.watch(key).await?;
            let value = self.store.get(key).await?;
            match self.store.exec_watched(&[(key.to_string(), version)], Pipeline::new()).await {
                Ok(()) => return Ok((decode(entity, key, value)?, version)),
                Err(StoreError::Conflict) => {
                    counter!(METRIC_LOCK_CONFLICT, "family" => "snapshot").increment(1);
                    debug!(entity = %entity, attempt, "Snapshot changed during read, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(CacheError::TransientLockConflict {
            key: key.to_string(),
            attempts: MAX_WATCH_RETRIES,
        })
    }

    /// Cache `entity` for `ttl`, replacing any placeholder.
    pub async fn put(&self, entity: &Entity, ttl: Duration) -> Result<(), CacheError> {
        let key = Self::key(entity.entity_ref());
        self.store
            .exec(Pipeline::new().set_ex(key, CacheValue::Hash(entity.to_fields()?), ttl))
            .await?;
        Ok(())
    }

    /// Delete now and again after `max_rw_time`.
    pub async fn invalidate(&self, entity: EntityRef) -> Result<(), CacheError> {
        let key = Self::key(entity);
        self.store.delete(&key).await?;

        let store = Arc::clone(&self.store);
        self.tasks
            .schedule("snapshot_second_delete", self.config.max_rw_time, async move {
                if let Err(err) = store.delete(&key).await {
                    warn!(key = %key, error = %err, "Second snapshot delete failed");
                }
            });
        Ok(())
    }
}

fn decode(
    entity: EntityRef,
    key: &str,
    value: Option<CacheValue>,
) -> Result<CachedSnapshot, CacheError> {
    match value {
        None => Ok(CachedSnapshot::Missing),
        Some(CacheValue::Empty) => Ok(CachedSnapshot::Absent),
        Some(CacheValue::Loading) => Ok(CachedSnapshot::Loading),
        Some(CacheValue::Hash(fields)) => {
            let decoded = Entity::from_fields(&fields)?;
            if decoded.entity_ref() != entity {
                return Err(DomainError::invariant(format!(
                    "`{key}` holds a snapshot of {}",
                    decoded.entity_ref()
                ))
                .into());
            }
            Ok(CachedSnapshot::Present(decoded))
        }
        Some(other) => Err(StoreError::wrong_type(key, "hash", &other).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::domain::entities::VideoSnapshot;
    use crate::infra::memory::MemoryRepositories;

    /// Store whose watched transactions conflict a fixed number of times.
    struct ConflictingStore {
        inner: MemoryStore,
        conflicts_left: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for ConflictingStore {
        async fn get(&self, key: &str) -> Result<Option<CacheValue>, StoreError> {
            self.inner.get(key).await
        }

        async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, StoreError> {
            self.inner.get_bit(key, offset).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn watch(&self, key: &str) -> Result<Version, StoreError> {
            self.inner.watch(key).await
        }

        async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError> {
            self.inner.exec(pipeline).await
        }

        async fn exec_watched(
            &self,
            watched: &[(String, Version)],
            pipeline: Pipeline,
        ) -> Result<(), StoreError> {
            let left = self.conflicts_left.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts_left.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict);
            }
            self.inner.exec_watched(watched, pipeline).await
        }
    }

    fn video() -> Entity {
        Entity::Video(VideoSnapshot {
            id: 7,
            title: "sunset".to_string(),
            author_id: 2,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
        })
    }

    fn cache_with(store: Arc<dyn CacheStore>, durable: Arc<MemoryRepositories>) -> SnapshotCache {
        SnapshotCache::new(
            store,
            durable,
            Arc::new(DelayedTasks::new()),
            CacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn miss_loads_and_caches_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryRepositories::new());
        durable.insert_user(2, "bob");
        durable.insert_video(7, 2, "sunset");
        let cache = cache_with(store.clone(), durable);

        let loaded = cache.get(EntityRef::video(7)).await.expect("loaded");
        assert!(matches!(loaded, Entity::Video(ref v) if v.author_id == 2));
        assert!(matches!(
            store.get("video:bsc:7").await.expect("raw"),
            Some(CacheValue::Hash(_))
        ));
    }

    #[tokio::test]
    async fn absent_entity_is_negatively_cached() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone(), Arc::new(MemoryRepositories::new()));

        let err = cache.get(EntityRef::video(8)).await.expect_err("absent");
        assert!(matches!(err, CacheError::NotFound { .. }));

        let err = cache.get(EntityRef::video(8)).await.expect_err("negative");
        assert!(matches!(err, CacheError::NegativeCacheHit { ref key } if key == "video:bsc:8"));
    }

    #[tokio::test]
    async fn reader_behind_a_load_claim_goes_to_the_durable_store() {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryRepositories::new());
        durable.insert_user(2, "bob");
        durable.insert_video(7, 2, "sunset");
        let cache = cache_with(store.clone(), durable);
        store
            .set_ex("video:bsc:7", CacheValue::Loading, Duration::from_secs(2))
            .await
            .expect("claim");

        let loaded = cache.get(EntityRef::video(7)).await.expect("durable read");
        assert!(matches!(loaded, Entity::Video(ref v) if v.author_id == 2));
        assert_eq!(
            store.get("video:bsc:7").await.expect("raw"),
            Some(CacheValue::Loading)
        );

        let err = cache.get(EntityRef::video(8)).await.expect_err("absent");
        assert!(matches!(err, CacheError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failed_durable_read_releases_the_claim() {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryRepositories::new());
        durable.insert_user(2, "bob");
        durable.insert_video(7, 2, "sunset");
        let cache = cache_with(store.clone(), durable.clone());

        durable.set_unavailable(true);
        let err = cache.get(EntityRef::video(7)).await.expect_err("unavailable");
        assert!(matches!(err, CacheError::Repo(_)));
        assert_eq!(store.get("video:bsc:7").await.expect("raw"), None);

        durable.set_unavailable(false);
        assert!(cache.get(EntityRef::video(7)).await.is_ok());
    }

    #[tokio::test]
    async fn put_overrides_placeholder() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store, Arc::new(MemoryRepositories::new()));
        let _ = cache.get(EntityRef::video(7)).await;

        cache.put(&video(), Duration::from_secs(60)).await.expect("put");
        assert_eq!(cache.get(EntityRef::video(7)).await.expect("cached"), video());
    }

    #[tokio::test]
    async fn read_retries_through_transient_conflicts() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            conflicts_left: AtomicUsize::new(2),
        });
        let cache = cache_with(store.clone(), Arc::new(MemoryRepositories::new()));
        cache.put(&video(), Duration::from_secs(60)).await.expect("put");

        assert_eq!(cache.get(EntityRef::video(7)).await.expect("third try"), video());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_transient_conflict() {
        let store = Arc::new(ConflictingStore {
            inner: MemoryStore::new(),
            conflicts_left: AtomicUsize::new(10),
        });
        let cache = cache_with(store, Arc::new(MemoryRepositories::new()));

        let err = cache.get(EntityRef::video(7)).await.expect_err("conflicts");
        assert!(matches!(
            err,
            CacheError::TransientLockConflict { attempts: 3, .. }
        ));
        assert!(err.is_transient());
    }
}
