use async_trait::async_trait;

use crate::application::repos::{CeilingsRepo, RepoError};
use crate::domain::types::EntityKind;

use super::PostgresRepositories;
use super::util::{entity_id, map_sqlx_error};

fn max_id_query(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::User => "SELECT COALESCE(MAX(id), 0) FROM users",
        EntityKind::Video => "SELECT COALESCE(MAX(id), 0) FROM videos",
        EntityKind::Comment => "SELECT COALESCE(MAX(id), 0) FROM comments",
        EntityKind::Message => "SELECT COALESCE(MAX(id), 0) FROM messages",
    }
}

#[async_trait]
impl CeilingsRepo for PostgresRepositories {
    async fn max_id(&self, kind: EntityKind) -> Result<u64, RepoError> {
        let max = sqlx::query_scalar::<_, i64>(max_id_query(kind))
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        entity_id(max)
    }
}
