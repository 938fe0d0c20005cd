//! Delta ledger: short-lived record of pending relation mutations.
//!
//! While an entry is live it is the authoritative answer for its relation.
//! Its TTL outlives the write-back flush that persists the change.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::types::Relation;

use super::keys::CacheKey;
use super::store::{CacheStore, CacheValue, Pipeline, StoreError, Version};

#[derive(Clone)]
pub struct DeltaLedger {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl DeltaLedger {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(relation: Relation) -> String {
        CacheKey::Ledger(relation).to_string()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Pending desired state, if any.
    pub async fn read(&self, relation: Relation) -> Result<Option<bool>, StoreError> {
        let key = Self::key(relation);
        let value = self.store.get(&key).await?;
        decode(&key, value)
    }

    /// Pending state together with the version a later write must watch.
    pub async fn read_watched(
        &self,
        relation: Relation,
    ) -> Result<(Option<bool>, Version), StoreError> {
        let key = Self::key(relation);
        let version = self.store.watch(&key).await?;
        let value = self.store.get(&key).await?;
        Ok((decode(&key, value)?, version))
    }

    /// Append the ledger write for `relation` to `pipeline`.
    pub fn stage(&self, pipeline: Pipeline, relation: Relation, desired: bool) -> Pipeline {
        pipeline.set_ex(Self::key(relation), CacheValue::Bool(desired), self.ttl)
    }
}

fn decode(key: &str, value: Option<CacheValue>) -> Result<Option<bool>, StoreError> {
    match value {
        None => Ok(None),
        Some(CacheValue::Bool(desired)) => Ok(Some(desired)),
        Some(CacheValue::Int(raw)) => Ok(Some(raw != 0)),
        Some(other) => Err(StoreError::wrong_type(key, "bool", &other)),
    }
}
