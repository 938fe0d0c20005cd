use async_trait::async_trait;

use crate::application::repos::{CountersRepo, RepoError};
use crate::domain::types::{CounterKey, CounterKind};

use super::PostgresRepositories;
use super::util::{db_id, map_sqlx_error};

/// One row per owner; a missing owner yields no row.
fn counter_query(kind: CounterKind) -> &'static str {
    match kind {
        CounterKind::UserWorks => {
            "SELECT (SELECT COUNT(*) FROM videos v WHERE v.author_id = u.id) FROM users u WHERE u.id = $1"
        }
        CounterKind::UserFavorites => "SELECT u.favorites_count FROM users u WHERE u.id = $1",
        CounterKind::UserFavorited => "SELECT u.favorited_count FROM users u WHERE u.id = $1",
        CounterKind::UserFollows => {
            "SELECT (SELECT COUNT(*) FROM follows f WHERE f.user_id = u.id) FROM users u WHERE u.id = $1"
        }
        CounterKind::UserFollowers => {
            "SELECT (SELECT COUNT(*) FROM follows f WHERE f.follow_id = u.id) FROM users u WHERE u.id = $1"
        }
        CounterKind::UserComments => {
            "SELECT (SELECT COUNT(*) FROM comments c WHERE c.author_id = u.id) FROM users u WHERE u.id = $1"
        }
        CounterKind::VideoFavorited => "SELECT v.favorited_count FROM videos v WHERE v.id = $1",
        CounterKind::VideoComments => "SELECT v.comments_count FROM videos v WHERE v.id = $1",
    }
}

#[async_trait]
impl CountersRepo for PostgresRepositories {
    async fn read_aggregate_count(&self, counter: CounterKey) -> Result<i64, RepoError> {
        sqlx::query_scalar::<_, i64>(counter_query(counter.kind))
            .bind(db_id(counter.id)?)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .ok_or(RepoError::NotFound)
    }
}
