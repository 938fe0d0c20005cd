//! Shared domain enumerations for relations, counters and entity kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Boolean directed relation kinds tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// User follows another user.
    Follow,
    /// User favorites a video.
    Favorite,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Follow => "follow",
            RelationKind::Favorite => "favorite",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest object id a relation may target. Objects are bit offsets in the
/// subject's bitmap, and shared stores cap offsets below 2^32.
pub const MAX_RELATION_OBJECT_ID: u64 = u32::MAX as u64;

/// A validated directed edge `subject -> object`.
///
/// Construction rejects self-relations for every kind and objects above
/// [`MAX_RELATION_OBJECT_ID`], so any value of this type that reaches the
/// cache or the durable store is already well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Relation {
    kind: RelationKind,
    subject: u64,
    object: u64,
}

impl Relation {
    pub fn new(kind: RelationKind, subject: u64, object: u64) -> Result<Self, DomainError> {
        if subject == object {
            return Err(DomainError::self_relation(kind, subject));
        }
        if object > MAX_RELATION_OBJECT_ID {
            return Err(DomainError::ObjectOutOfRange {
                kind,
                id: object,
                max: MAX_RELATION_OBJECT_ID,
            });
        }
        Ok(Self {
            kind,
            subject,
            object,
        })
    }

    pub fn follow(user_id: u64, follow_id: u64) -> Result<Self, DomainError> {
        Self::new(RelationKind::Follow, user_id, follow_id)
    }

    pub fn favorite(user_id: u64, video_id: u64) -> Result<Self, DomainError> {
        Self::new(RelationKind::Favorite, user_id, video_id)
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn subject(&self) -> u64 {
        self.subject
    }

    pub fn object(&self) -> u64 {
        self.object
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {})", self.kind, self.subject, self.object)
    }
}

/// Entity kinds that carry a primary key tracked by the ID ceiling cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Video,
    Comment,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::User,
        EntityKind::Video,
        EntityKind::Comment,
        EntityKind::Message,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Video => "video",
            EntityKind::Comment => "comment",
            EntityKind::Message => "message",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a single entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityRef {
    pub fn user(id: u64) -> Self {
        Self {
            kind: EntityKind::User,
            id,
        }
    }

    pub fn video(id: u64) -> Self {
        Self {
            kind: EntityKind::Video,
            id,
        }
    }

    pub fn comment(id: u64) -> Self {
        Self {
            kind: EntityKind::Comment,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Aggregate counters kept both as durable columns and as cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Videos published by a user.
    UserWorks,
    /// Videos a user has favorited.
    UserFavorites,
    /// Favorites received across all of a user's videos.
    UserFavorited,
    /// Users a user follows.
    UserFollows,
    /// Users following a user.
    UserFollowers,
    /// Comments written by a user.
    UserComments,
    /// Favorites received by a video.
    VideoFavorited,
    /// Comments attached to a video.
    VideoComments,
}

impl CounterKind {
    /// The entity kind whose id the counter is keyed by.
    pub fn owner(self) -> EntityKind {
        match self {
            CounterKind::VideoFavorited | CounterKind::VideoComments => EntityKind::Video,
            _ => EntityKind::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CounterKind::UserWorks => "user_works",
            CounterKind::UserFavorites => "user_favorites",
            CounterKind::UserFavorited => "user_favorited",
            CounterKind::UserFollows => "user_follows",
            CounterKind::UserFollowers => "user_followers",
            CounterKind::UserComments => "user_comments",
            CounterKind::VideoFavorited => "video_favorited",
            CounterKind::VideoComments => "video_comments",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One counter of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub kind: CounterKind,
    pub id: u64,
}

impl CounterKey {
    pub fn new(kind: CounterKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}
