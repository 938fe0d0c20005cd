use thiserror::Error;

use crate::{
    application::repos::RepoError, cache::CacheError, domain::error::DomainError,
    infra::error::InfraError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Infra(InfraError::Configuration { .. }) | AppError::Validation(_) => 2,
            AppError::Infra(InfraError::Database { .. }) | AppError::Repo(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        assert_eq!(AppError::validation("bad").exit_code(), 2);
        assert_eq!(
            AppError::from(InfraError::configuration("missing url")).exit_code(),
            2
        );
        assert_eq!(AppError::from(RepoError::Timeout).exit_code(), 3);
        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }
}
