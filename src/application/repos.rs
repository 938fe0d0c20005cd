//! Repository traits describing the durable store adapter.
//!
//! Every write runs inside a single ACID transaction that also maintains the
//! denormalized counter columns the cache mirrors.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::Entity;
use crate::domain::types::{CounterKey, EntityKind, EntityRef, Relation, RelationKind};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("relation already exists")]
    AlreadyExists,
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Direction of a relation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchOp {
    Create,
    Delete,
}

impl BatchOp {
    pub fn from_desired(desired: bool) -> Self {
        if desired { BatchOp::Create } else { BatchOp::Delete }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchOp::Create => "create",
            BatchOp::Delete => "delete",
        }
    }
}

/// Result of applying one relation batch.
///
/// Items are applied independently; a failing item is reported here and
/// does not roll back the rest of the batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub failed: Vec<(Relation, RepoError)>,
}

impl BatchOutcome {
    pub fn record(&mut self, relation: Relation, result: Result<(), RepoError>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(err) => self.failed.push((relation, err)),
        }
    }
}

#[async_trait]
pub trait RelationsRepo: Send + Sync {
    /// Create the relation and bump dependent counter columns.
    ///
    /// Fails with [`RepoError::AlreadyExists`] when the row is present.
    async fn create_relation(&self, relation: Relation) -> Result<(), RepoError>;

    /// Delete the relation and decrement dependent counter columns.
    ///
    /// Fails with [`RepoError::NotFound`] when the row is absent.
    async fn delete_relation(&self, relation: Relation) -> Result<(), RepoError>;

    async fn relation_exists(&self, relation: Relation) -> Result<bool, RepoError>;

    /// Apply every relation of `kind` in one transaction.
    async fn apply_relation_batch(
        &self,
        kind: RelationKind,
        op: BatchOp,
        relations: &[Relation],
    ) -> Result<BatchOutcome, RepoError>;
}

#[async_trait]
pub trait CountersRepo: Send + Sync {
    async fn read_aggregate_count(&self, counter: CounterKey) -> Result<i64, RepoError>;
}

#[async_trait]
pub trait EntitiesRepo: Send + Sync {
    async fn read_entity(&self, entity: EntityRef) -> Result<Option<Entity>, RepoError>;
}

#[async_trait]
pub trait CeilingsRepo: Send + Sync {
    /// Largest primary key of `kind`, zero for an empty table.
    async fn max_id(&self, kind: EntityKind) -> Result<u64, RepoError>;
}

/// Everything the cache engine consumes from the durable side.
pub trait DurableStore: RelationsRepo + CountersRepo + EntitiesRepo + CeilingsRepo {}

impl<T> DurableStore for T where T: RelationsRepo + CountersRepo + EntitiesRepo + CeilingsRepo {}
