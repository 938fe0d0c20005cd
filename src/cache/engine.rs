//! Engine facade used by calling business logic.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::application::repos::DurableStore;
use crate::domain::entities::Entity;
use crate::domain::types::{CounterKey, EntityKind, EntityRef, Relation, RelationKind};

use super::ceiling::{CeilingCache, CeilingCheck, CeilingRefresh};
use super::config::CacheConfig;
use super::counter::{Count, CounterCache};
use super::error::CacheError;
use super::queue::WriteBackQueue;
use super::relation::{RelationEngine, RelationRead};
use super::scheduler::{FlushReport, SyncScheduler};
use super::snapshot::SnapshotCache;
use super::store::CacheStore;
use super::tasks::DelayedTasks;

/// Handles to every engine component, wired over one cache store and one
/// durable store.
pub struct CacheEngine {
    config: CacheConfig,
    tasks: Arc<DelayedTasks>,
    queue: Arc<WriteBackQueue>,
    relations: RelationEngine,
    counters: Arc<CounterCache>,
    snapshots: Arc<SnapshotCache>,
    ceilings: Arc<CeilingCache>,
    scheduler: Arc<SyncScheduler>,
}

impl CacheEngine {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let tasks = Arc::new(DelayedTasks::new());
        let queue = Arc::new(WriteBackQueue::new());
        let counters = Arc::new(CounterCache::new(
            Arc::clone(&store),
            Arc::clone(&durable),
            Arc::clone(&tasks),
            config.clone(),
        ));
        let snapshots = Arc::new(SnapshotCache::new(
            Arc::clone(&store),
            Arc::clone(&durable),
            Arc::clone(&tasks),
            config.clone(),
        ));
        let ceilings = Arc::new(CeilingCache::new(Arc::clone(&store), Arc::clone(&durable)));
        let relations = RelationEngine::new(
            Arc::clone(&store),
            Arc::clone(&durable),
            Arc::clone(&counters),
            Arc::clone(&snapshots),
            Arc::clone(&queue),
            Arc::clone(&tasks),
            config.clone(),
        );
        let scheduler = Arc::new(SyncScheduler::new(
            config.clone(),
            Arc::clone(&queue),
            durable,
            Arc::clone(&ceilings),
            store,
        ));

        Self {
            config,
            tasks,
            queue,
            relations,
            counters,
            snapshots,
            ceilings,
            scheduler,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn set_relation(
        &self,
        kind: RelationKind,
        subject: u64,
        object: u64,
        desired: bool,
    ) -> Result<(), CacheError> {
        let relation = Relation::new(kind, subject, object)?;
        self.relations.set(relation, desired).await
    }

    /// Degrades to `false` for self-relations and unreadable state.
    pub async fn get_relation(&self, kind: RelationKind, subject: u64, object: u64) -> bool {
        match Relation::new(kind, subject, object) {
            Ok(relation) => self.relations.read(relation).await.value,
            Err(_) => false,
        }
    }

    pub async fn read_relation(
        &self,
        kind: RelationKind,
        subject: u64,
        object: u64,
    ) -> Result<RelationRead, CacheError> {
        let relation = Relation::new(kind, subject, object)?;
        Ok(self.relations.read(relation).await)
    }

    pub async fn get_count(&self, counter: CounterKey) -> Count {
        self.counters.get(counter).await
    }

    pub async fn invalidate_count(&self, counter: CounterKey) -> Result<(), CacheError> {
        Ok(self.counters.invalidate(counter).await?)
    }

    pub async fn get_snapshot(&self, entity: EntityRef) -> Result<Entity, CacheError> {
        self.snapshots.get(entity).await
    }

    pub async fn put_snapshot(&self, entity: &Entity, ttl: Duration) -> Result<(), CacheError> {
        self.snapshots.put(entity, ttl).await
    }

    pub async fn invalidate_snapshot(&self, entity: EntityRef) -> Result<(), CacheError> {
        self.snapshots.invalidate(entity).await
    }

    pub async fn check_ceiling(&self, kind: EntityKind, id: u64) -> CeilingCheck {
        self.ceilings.check(kind, id).await
    }

    pub async fn note_created(&self, kind: EntityKind, id: u64) -> Result<(), CacheError> {
        Ok(self.ceilings.note_created(kind, id).await?)
    }

    pub async fn refresh_ceilings(&self) -> CeilingRefresh {
        self.scheduler.refresh_ceilings().await
    }

    pub async fn flush(&self) -> FlushReport {
        self.scheduler.flush().await
    }

    pub fn pending_writes(&self) -> usize {
        self.queue.len()
    }

    /// Delayed corrections and deletes not yet run.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.pending()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Wait for scheduled bitmap corrections and second deletes.
    pub async fn settle(&self) {
        self.tasks.wait_idle().await;
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    /// Stop the scheduler, flush what is still queued, and cancel pending
    /// delayed tasks.
    pub async fn stop(&self) -> FlushReport {
        let report = self.scheduler.stop().await;
        let cancelled = self.tasks.shutdown();
        if report.deficit() > 0 {
            warn!(report = %report, "Final flush left items unpersisted");
        }
        info!(cancelled_tasks = cancelled, "Cache engine stopped");
        report
    }
}
