use async_trait::async_trait;
use sqlx::{Acquire, PgConnection};
use tracing::debug;

use crate::application::repos::{BatchOp, BatchOutcome, RelationsRepo, RepoError};
use crate::domain::types::{Relation, RelationKind};

use super::PostgresRepositories;
use super::util::{db_id, map_sqlx_error};

async fn create_in(conn: &mut PgConnection, relation: Relation) -> Result<(), RepoError> {
    let subject = db_id(relation.subject())?;
    let object = db_id(relation.object())?;

    match relation.kind() {
        RelationKind::Follow => {
            let inserted = sqlx::query(
                "INSERT INTO follows (user_id, follow_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(subject)
            .bind(object)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            if inserted.rows_affected() == 0 {
                return Err(RepoError::AlreadyExists);
            }
        }
        RelationKind::Favorite => {
            let inserted = sqlx::query(
                "INSERT INTO favorites (user_id, video_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(subject)
            .bind(object)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            if inserted.rows_affected() == 0 {
                return Err(RepoError::AlreadyExists);
            }
            adjust_favorite_counters(conn, subject, object, 1).await?;
        }
    }
    Ok(())
}

async fn delete_in(conn: &mut PgConnection, relation: Relation) -> Result<(), RepoError> {
    let subject = db_id(relation.subject())?;
    let object = db_id(relation.object())?;

    match relation.kind() {
        RelationKind::Follow => {
            let deleted = sqlx::query("DELETE FROM follows WHERE user_id = $1 AND follow_id = $2")
                .bind(subject)
                .bind(object)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
            if deleted.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
        }
        RelationKind::Favorite => {
            let deleted = sqlx::query("DELETE FROM favorites WHERE user_id = $1 AND video_id = $2")
                .bind(subject)
                .bind(object)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
            if deleted.rows_affected() == 0 {
                return Err(RepoError::NotFound);
            }
            adjust_favorite_counters(conn, subject, object, -1).await?;
        }
    }
    Ok(())
}

/// Favorites keep three denormalized columns; follow counts are aggregated on read.
async fn adjust_favorite_counters(
    conn: &mut PgConnection,
    user_id: i64,
    video_id: i64,
    delta: i64,
) -> Result<(), RepoError> {
    sqlx::query(
        "UPDATE users SET favorites_count = GREATEST(favorites_count + $2, 0), updated_at = now() \
         WHERE id = $1",
    )
    .bind(user_id)
    .bind(delta)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    let author_id: i64 = sqlx::query_scalar(
        "UPDATE videos SET favorited_count = GREATEST(favorited_count + $2, 0), updated_at = now() \
         WHERE id = $1 RETURNING author_id",
    )
    .bind(video_id)
    .bind(delta)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    sqlx::query(
        "UPDATE users SET favorited_count = GREATEST(favorited_count + $2, 0), updated_at = now() \
         WHERE id = $1",
    )
    .bind(author_id)
    .bind(delta)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

#[async_trait]
impl RelationsRepo for PostgresRepositories {
    async fn create_relation(&self, relation: Relation) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        create_in(&mut tx, relation).await?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn delete_relation(&self, relation: Relation) -> Result<(), RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        delete_in(&mut tx, relation).await?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn relation_exists(&self, relation: Relation) -> Result<bool, RepoError> {
        let sql = match relation.kind() {
            RelationKind::Follow => {
                "SELECT EXISTS (SELECT 1 FROM follows WHERE user_id = $1 AND follow_id = $2)"
            }
            RelationKind::Favorite => {
                "SELECT EXISTS (SELECT 1 FROM favorites WHERE user_id = $1 AND video_id = $2)"
            }
        };
        sqlx::query_scalar::<_, bool>(sql)
            .bind(db_id(relation.subject())?)
            .bind(db_id(relation.object())?)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn apply_relation_batch(
        &self,
        kind: RelationKind,
        op: BatchOp,
        relations: &[Relation],
    ) -> Result<BatchOutcome, RepoError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut outcome = BatchOutcome::default();

        for relation in relations {
            if relation.kind() != kind {
                outcome.record(
                    *relation,
                    Err(RepoError::InvalidInput {
                        message: format!("{relation} does not belong to a {kind} batch"),
                    }),
                );
                continue;
            }

            // Each item runs under its own savepoint so one failure keeps the rest.
            let mut item = tx.begin().await.map_err(map_sqlx_error)?;
            let result = match op {
                BatchOp::Create => create_in(&mut item, *relation).await,
                BatchOp::Delete => delete_in(&mut item, *relation).await,
            };
            let result = match result {
                Ok(()) => item.commit().await.map_err(map_sqlx_error),
                Err(err) => {
                    item.rollback().await.map_err(map_sqlx_error)?;
                    Err(err)
                }
            };
            outcome.record(*relation, result);
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(
            kind = kind.as_str(),
            op = op.as_str(),
            applied = outcome.applied,
            failed = outcome.failed.len(),
            "Applied relation batch"
        );
        Ok(outcome)
    }
}
