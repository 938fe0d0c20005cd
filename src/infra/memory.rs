//! In-process durable store.
//!
//! Mirrors the Postgres adapter closely enough for the engine's tests and for
//! running `serve` without a database: relation rows, denormalized counter
//! columns and max-id lookups all behave the same way.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{
    BatchOp, BatchOutcome, CeilingsRepo, CountersRepo, EntitiesRepo, RelationsRepo, RepoError,
};
use crate::cache::lock::{rw_read, rw_write};
use crate::domain::entities::{CommentSnapshot, Entity, UserSnapshot, VideoSnapshot};
use crate::domain::types::{
    CounterKey, CounterKind, EntityKind, EntityRef, Relation, RelationKind,
};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct State {
    users: BTreeMap<u64, UserSnapshot>,
    videos: BTreeMap<u64, VideoSnapshot>,
    comments: BTreeMap<u64, CommentSnapshot>,
    messages: BTreeSet<u64>,
    follows: BTreeSet<(u64, u64)>,
    favorites: BTreeSet<(u64, u64)>,
    counters: HashMap<CounterKey, i64>,
}

impl State {
    fn exists(&self, entity: EntityRef) -> bool {
        match entity.kind {
            EntityKind::User => self.users.contains_key(&entity.id),
            EntityKind::Video => self.videos.contains_key(&entity.id),
            EntityKind::Comment => self.comments.contains_key(&entity.id),
            EntityKind::Message => self.messages.contains(&entity.id),
        }
    }

    fn rows(&mut self, kind: RelationKind) -> &mut BTreeSet<(u64, u64)> {
        match kind {
            RelationKind::Follow => &mut self.follows,
            RelationKind::Favorite => &mut self.favorites,
        }
    }

    /// Counter columns touched by `relation`; fails when an endpoint is missing.
    fn dependents(&self, relation: Relation) -> Result<Vec<CounterKey>, RepoError> {
        let subject = relation.subject();
        let object = relation.object();
        if !self.users.contains_key(&subject) {
            return Err(RepoError::NotFound);
        }
        match relation.kind() {
            RelationKind::Follow => {
                if !self.users.contains_key(&object) {
                    return Err(RepoError::NotFound);
                }
                Ok(vec![
                    CounterKey::new(CounterKind::UserFollows, subject),
                    CounterKey::new(CounterKind::UserFollowers, object),
                ])
            }
            RelationKind::Favorite => {
                let video = self.videos.get(&object).ok_or(RepoError::NotFound)?;
                Ok(vec![
                    CounterKey::new(CounterKind::UserFavorites, subject),
                    CounterKey::new(CounterKind::UserFavorited, video.author_id),
                    CounterKey::new(CounterKind::VideoFavorited, object),
                ])
            }
        }
    }

    fn bump(&mut self, counters: &[CounterKey], delta: i64) {
        for counter in counters {
            *self.counters.entry(*counter).or_insert(0) += delta;
        }
    }
}

/// Durable store kept entirely in memory.
#[derive(Default)]
pub struct MemoryRepositories {
    state: RwLock<State>,
    unavailable: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every entity read for `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Make every repository call fail with a persistence error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn insert_user(&self, id: u64, username: &str) {
        let now = now_unix();
        let mut state = rw_write(&self.state, SOURCE, "insert_user");
        state.users.insert(
            id,
            UserSnapshot {
                id,
                username: username.to_string(),
                signature: String::new(),
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Insert a video and count it as a work of `author_id`.
    pub fn insert_video(&self, id: u64, author_id: u64, title: &str) {
        let now = now_unix();
        let mut state = rw_write(&self.state, SOURCE, "insert_video");
        let replaced = state.videos.insert(
            id,
            VideoSnapshot {
                id,
                title: title.to_string(),
                author_id,
                created_at: now,
                updated_at: now,
            },
        );
        if replaced.is_none() {
            state.bump(&[CounterKey::new(CounterKind::UserWorks, author_id)], 1);
        }
    }

    pub fn insert_comment(&self, id: u64, author_id: u64, video_id: u64, content: &str) {
        let now = now_unix();
        let mut state = rw_write(&self.state, SOURCE, "insert_comment");
        let replaced = state.comments.insert(
            id,
            CommentSnapshot {
                id,
                content: content.to_string(),
                author_id,
                video_id,
                created_at: now,
                updated_at: now,
            },
        );
        if replaced.is_none() {
            state.bump(
                &[
                    CounterKey::new(CounterKind::UserComments, author_id),
                    CounterKey::new(CounterKind::VideoComments, video_id),
                ],
                1,
            );
        }
    }

    pub fn insert_message(&self, id: u64) {
        rw_write(&self.state, SOURCE, "insert_message")
            .messages
            .insert(id);
    }

    /// Rename a user without touching any cache.
    pub fn rename_user(&self, id: u64, username: &str) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "rename_user");
        match state.users.get_mut(&id) {
            Some(user) => {
                user.username = username.to_string();
                user.updated_at = now_unix();
                true
            }
            None => false,
        }
    }

    /// Overwrite a counter column directly.
    pub fn set_count(&self, counter: CounterKey, value: i64) {
        rw_write(&self.state, SOURCE, "set_count")
            .counters
            .insert(counter, value);
    }

    /// Current number of rows of `kind`.
    pub fn relation_rows(&self, kind: RelationKind) -> usize {
        let state = rw_read(&self.state, SOURCE, "relation_rows");
        match kind {
            RelationKind::Follow => state.follows.len(),
            RelationKind::Favorite => state.favorites.len(),
        }
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::from_persistence("durable store unavailable"));
        }
        Ok(())
    }

    fn create_locked(state: &mut State, relation: Relation) -> Result<(), RepoError> {
        let counters = state.dependents(relation)?;
        if !state
            .rows(relation.kind())
            .insert((relation.subject(), relation.object()))
        {
            return Err(RepoError::AlreadyExists);
        }
        state.bump(&counters, 1);
        Ok(())
    }

    fn delete_locked(state: &mut State, relation: Relation) -> Result<(), RepoError> {
        let counters = state.dependents(relation)?;
        if !state
            .rows(relation.kind())
            .remove(&(relation.subject(), relation.object()))
        {
            return Err(RepoError::NotFound);
        }
        state.bump(&counters, -1);
        Ok(())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[async_trait]
impl RelationsRepo for MemoryRepositories {
    async fn create_relation(&self, relation: Relation) -> Result<(), RepoError> {
        self.check_available()?;
        let mut state = rw_write(&self.state, SOURCE, "create_relation");
        Self::create_locked(&mut state, relation)
    }

    async fn delete_relation(&self, relation: Relation) -> Result<(), RepoError> {
        self.check_available()?;
        let mut state = rw_write(&self.state, SOURCE, "delete_relation");
        Self::delete_locked(&mut state, relation)
    }

    async fn relation_exists(&self, relation: Relation) -> Result<bool, RepoError> {
        self.check_available()?;
        let state = rw_read(&self.state, SOURCE, "relation_exists");
        let row = (relation.subject(), relation.object());
        Ok(match relation.kind() {
            RelationKind::Follow => state.follows.contains(&row),
            RelationKind::Favorite => state.favorites.contains(&row),
        })
    }

    async fn apply_relation_batch(
        &self,
        kind: RelationKind,
        op: BatchOp,
        relations: &[Relation],
    ) -> Result<BatchOutcome, RepoError> {
        self.check_available()?;
        let mut state = rw_write(&self.state, SOURCE, "apply_relation_batch");
        let mut outcome = BatchOutcome::default();
        for relation in relations {
            let result = if relation.kind() != kind {
                Err(RepoError::InvalidInput {
                    message: format!("{relation} does not belong to a {kind} batch"),
                })
            } else {
                match op {
                    BatchOp::Create => Self::create_locked(&mut state, *relation),
                    BatchOp::Delete => Self::delete_locked(&mut state, *relation),
                }
            };
            outcome.record(*relation, result);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl CountersRepo for MemoryRepositories {
    async fn read_aggregate_count(&self, counter: CounterKey) -> Result<i64, RepoError> {
        self.check_available()?;
        let state = rw_read(&self.state, SOURCE, "read_aggregate_count");
        let owner = EntityRef {
            kind: counter.kind.owner(),
            id: counter.id,
        };
        if !state.exists(owner) {
            return Err(RepoError::NotFound);
        }
        Ok(state.counters.get(&counter).copied().unwrap_or(0))
    }
}

#[async_trait]
impl EntitiesRepo for MemoryRepositories {
    async fn read_entity(&self, entity: EntityRef) -> Result<Option<Entity>, RepoError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;
        let state = rw_read(&self.state, SOURCE, "read_entity");
        let found = match entity.kind {
            EntityKind::User => state.users.get(&entity.id).cloned().map(Entity::User),
            EntityKind::Video => state.videos.get(&entity.id).cloned().map(Entity::Video),
            EntityKind::Comment => state.comments.get(&entity.id).cloned().map(Entity::Comment),
            EntityKind::Message => {
                return Err(RepoError::InvalidInput {
                    message: "messages have no snapshot".to_string(),
                });
            }
        };
        Ok(found)
    }
}

#[async_trait]
impl CeilingsRepo for MemoryRepositories {
    async fn max_id(&self, kind: EntityKind) -> Result<u64, RepoError> {
        self.check_available()?;
        let state = rw_read(&self.state, SOURCE, "max_id");
        let max = match kind {
            EntityKind::User => state.users.keys().next_back(),
            EntityKind::Video => state.videos.keys().next_back(),
            EntityKind::Comment => state.comments.keys().next_back(),
            EntityKind::Message => state.messages.iter().next_back(),
        };
        Ok(max.copied().unwrap_or(0))
    }
}
