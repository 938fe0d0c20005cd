use thiserror::Error;

use crate::application::repos::RepoError;
use crate::domain::error::DomainError;
use crate::domain::types::{EntityRef, RelationKind};

use super::store::StoreError;

/// Errors surfaced by the cache engine.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A pending mutation already holds the requested state.
    #[error("{kind} relation is already pending as {desired}")]
    AlreadyInDesiredState { kind: RelationKind, desired: bool },
    #[error("{kind} relation of entity {id} with itself is not allowed")]
    SelfRelationRejected { kind: RelationKind, id: u64 },
    /// The key holds a negative-cache placeholder: the entity is known absent.
    #[error("`{key}` is cached as absent")]
    NegativeCacheHit { key: String },
    #[error("optimistic read of `{key}` conflicted {attempts} times")]
    TransientLockConflict { key: String, attempts: u32 },
    #[error("{entity} not found")]
    NotFound { entity: EntityRef },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Domain(DomainError),
}

impl From<DomainError> for CacheError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::SelfRelation { kind, id } => Self::SelfRelationRejected { kind, id },
            other => Self::Domain(other),
        }
    }
}

impl CacheError {
    /// Whether the caller may fall back to the durable store directly.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::TransientLockConflict { .. } | CacheError::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Relation;

    #[test]
    fn self_relation_domain_error_maps_to_rejection() {
        let err: CacheError = Relation::follow(4, 4).expect_err("self").into();
        assert!(matches!(
            err,
            CacheError::SelfRelationRejected {
                kind: RelationKind::Follow,
                id: 4
            }
        ));
    }

    #[test]
    fn lock_conflicts_are_transient() {
        let err = CacheError::TransientLockConflict {
            key: "video:bsc:7".to_string(),
            attempts: 3,
        };
        assert!(err.is_transient());
        assert!(!CacheError::NotFound { entity: EntityRef::video(7) }.is_transient());
    }
}
