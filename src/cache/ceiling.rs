//! ID ceiling cache: approximate maximum primary key per entity kind.
//!
//! Used for coarse bounds checks only. A ceiling may lag behind freshly
//! created rows until [`CeilingCache::note_created`] or the next refresh.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::application::repos::DurableStore;
use crate::domain::types::EntityKind;

use super::config::MAX_WATCH_RETRIES;
use super::keys::CacheKey;
use super::store::{CacheStore, CacheValue, Pipeline, StoreError};

/// Outcome of a bounds check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingCheck {
    WithinBound,
    OutOfBound,
    /// No ceiling is known; the caller must not treat this as in range.
    Unknown,
}

/// Result of one refresh pass.
#[derive(Debug, Default)]
pub struct CeilingRefresh {
    pub updated: Vec<(EntityKind, u64)>,
    pub failed: Vec<(EntityKind, String)>,
}

impl CeilingRefresh {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for CeilingRefresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CeilingRefresh {{ updated: {}, failed: {} }}",
            self.updated.len(),
            self.failed.len()
        )
    }
}

pub struct CeilingCache {
    store: Arc<dyn CacheStore>,
    durable: Arc<dyn DurableStore>,
}

impl CeilingCache {
    pub fn new(store: Arc<dyn CacheStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { store, durable }
    }

    fn key(kind: EntityKind) -> String {
        CacheKey::Ceiling(kind).to_string()
    }

    pub async fn get(&self, kind: EntityKind) -> Result<Option<u64>, StoreError> {
        let key = Self::key(kind);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(CacheValue::Int(value)) => Ok(Some(u64::try_from(value).unwrap_or(0))),
            Some(other) => Err(StoreError::wrong_type(&key, "int", &other)),
        }
    }

    pub async fn set(&self, kind: EntityKind, max_id: u64) -> Result<(), StoreError> {
        let value = i64::try_from(max_id).unwrap_or(i64::MAX);
        self.store
            .exec(Pipeline::new().set(Self::key(kind), CacheValue::Int(value)))
            .await
    }

    pub async fn check(&self, kind: EntityKind, id: u64) -> CeilingCheck {
        if id == 0 {
            return CeilingCheck::OutOfBound;
        }
        match self.get(kind).await {
            Ok(Some(max_id)) if id <= max_id => CeilingCheck::WithinBound,
            Ok(Some(_)) => CeilingCheck::OutOfBound,
            Ok(None) => CeilingCheck::Unknown,
            Err(err) => {
                warn!(kind = %kind, error = %err, "Ceiling read failed");
                CeilingCheck::Unknown
            }
        }
    }

    /// Raise the ceiling of `kind` to at least `id`.
    pub async fn note_created(&self, kind: EntityKind, id: u64) -> Result<(), StoreError> {
        let key = Self::key(kind);
        let value = i64::try_from(id).unwrap_or(i64::MAX);
        for _ in 0..MAX_WATCH_RETRIES {
            let version = self.store.watch(&key).await?;
            if let Some(current) = self.get(kind).await?
                && current >= id
            {
                return Ok(());
            }
            match self
                .store
                .exec_watched(
                    &[(key.clone(), version)],
                    Pipeline::new().set(key.clone(), CacheValue::Int(value)),
                )
                .await
            {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        debug!(kind = %kind, id, "Ceiling raise kept conflicting, leaving it to refresh");
        Ok(())
    }

    /// Reload every ceiling from durable `MAX(id)`, per kind best effort.
    pub async fn refresh(&self) -> CeilingRefresh {
        let mut report = CeilingRefresh::default();
        for kind in EntityKind::ALL {
            let result = match self.durable.max_id(kind).await {
                Ok(max_id) => self
                    .set(kind, max_id)
                    .await
                    .map(|()| max_id)
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match result {
                Ok(max_id) => report.updated.push((kind, max_id)),
                Err(reason) => {
                    warn!(kind = %kind, error = %reason, "Ceiling refresh failed");
                    report.failed.push((kind, reason));
                }
            }
        }
        info!(report = %report, "ID ceilings refreshed");
        report
    }
}
