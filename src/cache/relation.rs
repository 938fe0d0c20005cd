//! Relation consistency engine.
//!
//! Writes go to the delta ledger and the dependent counters in one watched
//! pipeline, then to the write-back queue. A delayed task flips the bitmap
//! bit once the flush window has passed, whatever the flush outcome.
//!
//! Reads prefer a live ledger entry, otherwise sample a durable bypass with
//! `distrust_probability` (repairing the bit on the way back), otherwise
//! trust the bitmap.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::application::repos::DurableStore;
use crate::domain::entities::Entity;
use crate::domain::types::{CounterKey, CounterKind, EntityRef, Relation, RelationKind};

use super::bitmap::BitmapStore;
use super::config::{CacheConfig, MAX_WATCH_RETRIES};
use super::counter::CounterCache;
use super::error::CacheError;
use super::ledger::DeltaLedger;
use super::queue::{SyncMessage, WriteBackQueue};
use super::snapshot::{METRIC_LOCK_CONFLICT, SnapshotCache};
use super::store::{CacheStore, Pipeline, StoreError};
use super::tasks::DelayedTasks;

const METRIC_LEDGER_HIT: &str = "sluice_ledger_hit_total";
const METRIC_BYPASS: &str = "sluice_relation_bypass_total";
const METRIC_CORRECTION_FAILED: &str = "sluice_correction_failed_total";

/// Where a relation answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Ledger,
    Bitmap,
    Durable,
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadSource::Ledger => "ledger",
            ReadSource::Bitmap => "bitmap",
            ReadSource::Durable => "durable",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationRead {
    pub value: bool,
    pub source: ReadSource,
}

pub struct RelationEngine {
    store: Arc<dyn CacheStore>,
    durable: Arc<dyn DurableStore>,
    ledger: DeltaLedger,
    bitmaps: BitmapStore,
    counters: Arc<CounterCache>,
    snapshots: Arc<SnapshotCache>,
    queue: Arc<WriteBackQueue>,
    tasks: Arc<DelayedTasks>,
    config: CacheConfig,
}

impl RelationEngine {
    pub fn new(
        store: Arc<dyn CacheStore>,
        durable: Arc<dyn DurableStore>,
        counters: Arc<CounterCache>,
        snapshots: Arc<SnapshotCache>,
        queue: Arc<WriteBackQueue>,
        tasks: Arc<DelayedTasks>,
        config: CacheConfig,
    ) -> Self {
        Self {
            ledger: DeltaLedger::new(Arc::clone(&store), config.ledger_ttl()),
            bitmaps: BitmapStore::new(Arc::clone(&store)),
            store,
            durable,
            counters,
            snapshots,
            queue,
            tasks,
            config,
        }
    }

    /// Record `relation` as `desired`.
    ///
    /// Fails with [`CacheError::AlreadyInDesiredState`] when a pending
    /// mutation already holds that state, leaving counters untouched.
    pub async fn set(&self, relation: Relation, desired: bool) -> Result<(), CacheError> {
        let counters = self.dependent_counters(relation).await?;
        for counter in &counters {
            self.counters.get(*counter).await;
        }

        let key = DeltaLedger::key(relation);
        let delta = if desired { 1 } else { -1 };
        let mut committed = false;
        for attempt in 1..=MAX_WATCH_RETRIES {
            let (pending, version) = self.ledger.read_watched(relation).await?;
            if pending == Some(desired) {
                debug!(relation = %relation, desired, "Duplicate relation mutation rejected");
                return Err(CacheError::AlreadyInDesiredState {
                    kind: relation.kind(),
                    desired,
                });
            }

            let pipeline = self.ledger.stage(Pipeline::new(), relation, desired);
            let pipeline =
                CounterCache::stage_adjust(pipeline, &counters, delta, self.ledger.ttl());
            match self
                .store
                .exec_watched(&[(key.clone(), version)], pipeline)
                .await
            {
                Ok(()) => {
                    committed = true;
                    break;
                }
                Err(StoreError::Conflict) => {
                    counter!(METRIC_LOCK_CONFLICT, "family" => "ledger").increment(1);
                    debug!(relation = %relation, attempt, "Ledger changed during mutation, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        if !committed {
            return Err(CacheError::TransientLockConflict {
                key,
                attempts: MAX_WATCH_RETRIES,
            });
        }

        self.queue.enqueue(SyncMessage::new(relation, desired));
        self.schedule_correction(relation, desired);

        info!(relation = %relation, desired, "Relation mutation recorded");
        Ok(())
    }

    fn schedule_correction(&self, relation: Relation, desired: bool) {
        let bitmaps = self.bitmaps.clone();
        self.tasks
            .schedule("bitmap_correction", self.config.correction_delay(), async move {
                match bitmaps.set(relation, desired).await {
                    Ok(()) => debug!(relation = %relation, desired, "Bitmap corrected"),
                    Err(err) => {
                        counter!(METRIC_CORRECTION_FAILED).increment(1);
                        warn!(relation = %relation, error = %err, "Bitmap correction failed");
                    }
                }
            });
    }

    /// Counters that move with `relation`.
    async fn dependent_counters(&self, relation: Relation) -> Result<Vec<CounterKey>, CacheError> {
        match relation.kind() {
            RelationKind::Follow => Ok(vec![
                CounterKey::new(CounterKind::UserFollows, relation.subject()),
                CounterKey::new(CounterKind::UserFollowers, relation.object()),
            ]),
            RelationKind::Favorite => {
                let author = self.video_author(relation.object()).await?;
                Ok(vec![
                    CounterKey::new(CounterKind::UserFavorites, relation.subject()),
                    CounterKey::new(CounterKind::UserFavorited, author),
                    CounterKey::new(CounterKind::VideoFavorited, relation.object()),
                ])
            }
        }
    }

    async fn video_author(&self, video_id: u64) -> Result<u64, CacheError> {
        let video = EntityRef::video(video_id);
        let entity = match self.snapshots.get(video).await {
            Ok(entity) => entity,
            Err(CacheError::NegativeCacheHit { .. } | CacheError::NotFound { .. }) => {
                return Err(CacheError::NotFound { entity: video });
            }
            Err(CacheError::Repo(err)) => return Err(err.into()),
            Err(err) => {
                debug!(video = %video, error = %err, "Snapshot unavailable, reading durable store");
                self.durable
                    .read_entity(video)
                    .await?
                    .ok_or(CacheError::NotFound { entity: video })?
            }
        };
        match entity {
            Entity::Video(snapshot) => Ok(snapshot.author_id),
            _ => Err(CacheError::NotFound { entity: video }),
        }
    }

    /// Answer with the source that produced it.
    pub async fn read(&self, relation: Relation) -> RelationRead {
        match self.ledger.read(relation).await {
            Ok(Some(value)) => {
                counter!(METRIC_LEDGER_HIT, "kind" => relation.kind().as_str()).increment(1);
                return RelationRead {
                    value,
                    source: ReadSource::Ledger,
                };
            }
            Ok(None) => {}
            Err(err) => {
                warn!(relation = %relation, error = %err, "Ledger read failed");
                return self.read_durable(relation, false).await;
            }
        }

        let distrust = self.config.effective_distrust();
        if rand::thread_rng().gen_bool(distrust) {
            counter!(METRIC_BYPASS, "kind" => relation.kind().as_str()).increment(1);
            return self.read_durable(relation, true).await;
        }

        match self.bitmaps.get(relation).await {
            Ok(value) => RelationRead {
                value,
                source: ReadSource::Bitmap,
            },
            Err(err) => {
                warn!(relation = %relation, error = %err, "Bitmap read failed");
                self.read_durable(relation, false).await
            }
        }
    }

    async fn read_durable(&self, relation: Relation, repair: bool) -> RelationRead {
        let value = match self.durable.relation_exists(relation).await {
            Ok(value) => value,
            Err(err) => {
                warn!(relation = %relation, error = %err, "Durable relation read failed");
                false
            }
        };
        if repair && let Err(err) = self.bitmaps.set(relation, value).await {
            warn!(relation = %relation, error = %err, "Bitmap read-repair failed");
        }
        RelationRead {
            value,
            source: ReadSource::Durable,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::repos::RelationsRepo;
    use crate::cache::counter::Count;
    use crate::cache::memory::MemoryStore;
    use crate::infra::memory::MemoryRepositories;

    struct Fixture {
        store: Arc<MemoryStore>,
        durable: Arc<MemoryRepositories>,
        counters: Arc<CounterCache>,
        queue: Arc<WriteBackQueue>,
        tasks: Arc<DelayedTasks>,
        engine: RelationEngine,
    }

    fn fixture(distrust_probability: f64) -> Fixture {
        let config = CacheConfig {
            distrust_probability,
            ..CacheConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryRepositories::new());
        durable.insert_user(1, "alice");
        durable.insert_user(2, "bob");
        durable.insert_video(7, 2, "sunset");

        let tasks = Arc::new(DelayedTasks::new());
        let queue = Arc::new(WriteBackQueue::new());
        let counters = Arc::new(CounterCache::new(
            store.clone(),
            durable.clone(),
            tasks.clone(),
            config.clone(),
        ));
        let snapshots = Arc::new(SnapshotCache::new(
            store.clone(),
            durable.clone(),
            tasks.clone(),
            config.clone(),
        ));
        let engine = RelationEngine::new(
            store.clone(),
            durable.clone(),
            counters.clone(),
            snapshots,
            queue.clone(),
            tasks.clone(),
            config,
        );
        Fixture {
            store,
            durable,
            counters,
            queue,
            tasks,
            engine,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_writes_ledger_counters_and_queue() {
        let fx = fixture(0.0);
        let follow = Relation::follow(1, 2).expect("relation");

        fx.engine.set(follow, true).await.expect("set");

        assert_eq!(
            fx.engine.read(follow).await,
            RelationRead {
                value: true,
                source: ReadSource::Ledger
            }
        );
        let follows = CounterKey::new(CounterKind::UserFollows, 1);
        let followers = CounterKey::new(CounterKind::UserFollowers, 2);
        assert_eq!(fx.counters.get(follows).await, Count::Value(1));
        assert_eq!(fx.counters.get(followers).await, Count::Value(1));
        assert_eq!(fx.queue.len(), 1);
        assert_eq!(fx.tasks.pending(), 1);

        let counter_ttl = fx.store.ttl("user:flw:count:1").expect("ttl");
        assert!(counter_ttl <= fx.engine.ledger.ttl());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_mutation_is_rejected_without_counter_drift() {
        let fx = fixture(0.0);
        let follow = Relation::follow(1, 2).expect("relation");

        fx.engine.set(follow, true).await.expect("first");
        let err = fx.engine.set(follow, true).await.expect_err("duplicate");
        assert!(matches!(
            err,
            CacheError::AlreadyInDesiredState { desired: true, .. }
        ));

        let follows = CounterKey::new(CounterKind::UserFollows, 1);
        assert_eq!(fx.counters.get(follows).await, Count::Value(1));
        assert_eq!(fx.queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bitmap_is_corrected_after_sync_delay_without_flush() {
        let fx = fixture(0.0);
        let follow = Relation::follow(1, 2).expect("relation");
        fx.engine.set(follow, true).await.expect("set");

        tokio::time::sleep(fx.engine.config.ledger_ttl() + Duration::from_millis(1)).await;
        fx.tasks.wait_idle().await;

        assert_eq!(
            fx.engine.read(follow).await,
            RelationRead {
                value: true,
                source: ReadSource::Bitmap
            }
        );
    }

    #[tokio::test]
    async fn forced_bypass_repairs_the_bitmap() {
        let fx = fixture(1.0);
        let follow = Relation::follow(1, 2).expect("relation");
        fx.durable.create_relation(follow).await.expect("durable row");

        let read = fx.engine.read(follow).await;
        assert_eq!(
            read,
            RelationRead {
                value: true,
                source: ReadSource::Durable
            }
        );
        assert!(fx.engine.bitmaps.get(follow).await.expect("bit"));
    }

    #[tokio::test]
    async fn zero_distrust_never_bypasses() {
        let fx = fixture(0.0);
        let follow = Relation::follow(1, 2).expect("relation");
        fx.durable.create_relation(follow).await.expect("durable row");

        for _ in 0..1000 {
            assert_eq!(fx.engine.read(follow).await.source, ReadSource::Bitmap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn favorite_succeeds_while_another_reader_loads_the_video() {
        use crate::cache::store::CacheValue;

        let fx = fixture(0.0);
        fx.store
            .set_ex("video:bsc:7", CacheValue::Loading, Duration::from_secs(2))
            .await
            .expect("claim");

        let favorite = Relation::favorite(1, 7).expect("relation");
        fx.engine.set(favorite, true).await.expect("favorite");
        assert_eq!(fx.queue.len(), 1);
    }

    #[tokio::test]
    async fn favorite_of_missing_video_is_not_found() {
        let fx = fixture(0.0);
        let favorite = Relation::favorite(1, 99).expect("relation");

        let err = fx.engine.set(favorite, true).await.expect_err("missing video");
        assert!(matches!(err, CacheError::NotFound { .. }));
        assert!(fx.queue.is_empty());
    }
}
