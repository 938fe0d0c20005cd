//! Counter cache with negative caching and double-delete invalidation.

use std::fmt;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::application::repos::DurableStore;
use crate::domain::types::CounterKey;

use super::config::CacheConfig;
use super::keys::CacheKey;
use super::store::{CacheStore, CacheValue, Pipeline, StoreError, Version};
use super::tasks::DelayedTasks;

pub(super) const METRIC_NEGATIVE_CACHE_HIT: &str = "sluice_negative_cache_hit_total";

/// A cached count, or the explicit absence of one.
///
/// `Unknown` is never zero: a placeholder or a failed durable read means the
/// caller cannot rely on the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Value(i64),
    Unknown,
}

impl Count {
    pub fn value(self) -> Option<i64> {
        match self {
            Count::Value(value) => Some(value),
            Count::Unknown => None,
        }
    }
}

impl fmt::Display for Count {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Count::Value(value) => write!(f, "{value}"),
            Count::Unknown => f.write_str("unknown"),
        }
    }
}

pub struct CounterCache {
    store: Arc<dyn CacheStore>,
    durable: Arc<dyn DurableStore>,
    tasks: Arc<DelayedTasks>,
    config: CacheConfig,
}

impl CounterCache {
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

    pub fn key(counter: CounterKey) -> String {
        CacheKey::counter(counter.kind, counter.id).to_string()
    }

    /// Read-through lookup.
    ///
    /// A miss claims the key with a placeholder before touching the durable
    /// store, so concurrent readers see `Unknown` instead of stampeding.
    pub async fn get(&self, counter: CounterKey) -> Count {
        let key = Self::key(counter);
        match self.lookup(counter, &key).await {
            Ok(count) => count,
            Err(err) => {
                warn!(counter = %counter, error = %err, "Counter cache read failed");
                Count::Unknown
            }
        }
    }

    async fn lookup(&self, counter: CounterKey, key: &str) -> Result<Count, StoreError> {
        let version = self.store.watch(key).await?;
        match self.store.get(key).await? {
            Some(CacheValue::Int(value)) => return Ok(Count::Value(value)),
            Some(CacheValue::Empty) => {
                counter!(METRIC_NEGATIVE_CACHE_HIT, "family" => "counter").increment(1);
                return Ok(Count::Unknown);
            }
            Some(other) => return Err(StoreError::wrong_type(key, "int", &other)),
            None => {}
        }

        let claim = Pipeline::new().set_ex(key, CacheValue::Empty, self.config.negative_ttl());
        match self
            .store
            .exec_watched(&[(key.to_string(), version)], claim)
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict) => {
                debug!(counter = %counter, "Counter load already claimed");
                return Ok(match self.store.get(key).await? {
                    Some(CacheValue::Int(value)) => Count::Value(value),
                    _ => Count::Unknown,
                });
            }
            Err(err) => return Err(err),
        }
        let claimed = self.store.watch(key).await?;

        let value = match self.durable.read_aggregate_count(counter).await {
            Ok(value) => value,
            Err(err) => {
                warn!(counter = %counter, error = %err, "Durable counter read failed, keeping placeholder");
                return Ok(Count::Unknown);
            }
        };

        let fill = Pipeline::new().set_ex(key, CacheValue::Int(value), self.config.positive_ttl());
        match self
            .store
            .exec_watched(&[(key.to_string(), claimed)], fill)
            .await
        {
            Ok(()) | Err(StoreError::Conflict) => Ok(Count::Value(value)),
            Err(err) => Err(err),
        }
    }

    /// Delete now and again after `max_rw_time`.
    pub async fn invalidate(&self, counter: CounterKey) -> Result<(), StoreError> {
        let key = Self::key(counter);
        self.store.delete(&key).await?;

        let store = Arc::clone(&self.store);
        self.tasks
            .schedule("counter_second_delete", self.config.max_rw_time, async move {
                if let Err(err) = store.delete(&key).await {
                    warn!(key = %key, error = %err, "Second counter delete failed");
                }
            });
        Ok(())
    }

    /// Append a ±`delta` adjustment of `counters` to `pipeline`, pinning
    /// their TTL to `ttl`.
    pub fn stage_adjust(
        pipeline: Pipeline,
        counters: &[CounterKey],
        delta: i64,
        ttl: std::time::Duration,
    ) -> Pipeline {
        counters.iter().fold(pipeline, |pipeline, counter| {
            let key = Self::key(*counter);
            pipeline.incr_if_present(key.clone(), delta).expire(key, ttl)
        })
    }

    #[cfg(test)]
    pub async fn is_absent(&self, counter: CounterKey) -> Result<bool, StoreError> {
        Ok(self.store.watch(&Self::key(counter)).await? == Version::ABSENT)
    }
}
