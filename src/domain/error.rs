use thiserror::Error;

use super::types::RelationKind;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain validation failed: {message}")]
    Validation { message: String },
    #[error("domain invariant violated: {message}")]
    Invariant { message: String },
    #[error("{kind} relation of entity {id} with itself is not allowed")]
    SelfRelation { kind: RelationKind, id: u64 },
    #[error("{kind} relation target {id} exceeds the maximum object id {max}")]
    ObjectOutOfRange { kind: RelationKind, id: u64, max: u64 },
}

impl DomainError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    pub fn self_relation(kind: RelationKind, id: u64) -> Self {
        Self::SelfRelation { kind, id }
    }
}
