use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{EntitiesRepo, RepoError};
use crate::domain::entities::{CommentSnapshot, Entity, UserSnapshot, VideoSnapshot};
use crate::domain::types::{EntityKind, EntityRef};

use super::PostgresRepositories;
use super::util::{db_id, entity_id, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    signature: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<UserRow> for UserSnapshot {
    type Error = RepoError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity_id(row.id)?,
            username: row.username,
            signature: row.signature,
            created_at: row.created_at.unix_timestamp(),
            updated_at: row.updated_at.unix_timestamp(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct VideoRow {
    id: i64,
    title: String,
    author_id: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<VideoRow> for VideoSnapshot {
    type Error = RepoError;

    fn try_from(row: VideoRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity_id(row.id)?,
            title: row.title,
            author_id: entity_id(row.author_id)?,
            created_at: row.created_at.unix_timestamp(),
            updated_at: row.updated_at.unix_timestamp(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: i64,
    content: String,
    author_id: i64,
    video_id: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CommentRow> for CommentSnapshot {
    type Error = RepoError;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entity_id(row.id)?,
            content: row.content,
            author_id: entity_id(row.author_id)?,
            video_id: entity_id(row.video_id)?,
            created_at: row.created_at.unix_timestamp(),
            updated_at: row.updated_at.unix_timestamp(),
        })
    }
}

#[async_trait]
impl EntitiesRepo for PostgresRepositories {
    async fn read_entity(&self, entity: EntityRef) -> Result<Option<Entity>, RepoError> {
        let id = db_id(entity.id)?;
        match entity.kind {
            EntityKind::User => {
                let row = sqlx::query_as::<_, UserRow>(
                    "SELECT id, username, signature, created_at, updated_at FROM users WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;
                row.map(|row| UserSnapshot::try_from(row).map(Entity::User))
                    .transpose()
            }
            EntityKind::Video => {
                let row = sqlx::query_as::<_, VideoRow>(
                    "SELECT id, title, author_id, created_at, updated_at FROM videos WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;
                row.map(|row| VideoSnapshot::try_from(row).map(Entity::Video))
                    .transpose()
            }
            EntityKind::Comment => {
                let row = sqlx::query_as::<_, CommentRow>(
                    "SELECT id, content, author_id, video_id, created_at, updated_at \
                     FROM comments WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;
                row.map(|row| CommentSnapshot::try_from(row).map(Entity::Comment))
                    .transpose()
            }
            EntityKind::Message => Err(RepoError::InvalidInput {
                message: "messages have no snapshot".to_string(),
            }),
        }
    }
}
