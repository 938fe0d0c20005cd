use crate::application::repos::RepoError;

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            RepoError::AlreadyExists
        }
        sqlx::Error::Database(db)
            if db.message().contains("violates foreign key constraint")
                || db.message().contains("invalid input syntax") =>
        {
            RepoError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => RepoError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

/// Primary keys are `BIGINT`; ids beyond `i64::MAX` cannot exist in a row.
pub(super) fn db_id(id: u64) -> Result<i64, RepoError> {
    i64::try_from(id).map_err(|_| RepoError::InvalidInput {
        message: format!("id {id} exceeds BIGINT range"),
    })
}

pub(super) fn entity_id(value: i64) -> Result<u64, RepoError> {
    u64::try_from(value).map_err(|_| RepoError::Integrity {
        message: format!("negative id {value} in storage"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepoError::NotFound
        ));
    }

    #[test]
    fn id_conversion_bounds() {
        assert_eq!(db_id(42).expect("fits"), 42);
        assert!(matches!(
            db_id(u64::MAX),
            Err(RepoError::InvalidInput { .. })
        ));
        assert!(matches!(entity_id(-1), Err(RepoError::Integrity { .. })));
    }
}
