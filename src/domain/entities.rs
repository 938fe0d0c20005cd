//! Denormalized entity snapshots mirrored from persistent storage.
//!
//! Snapshots are cached as flat field maps. Each field value is the JSON
//! encoding of the corresponding struct field, so a snapshot round-trips
//! through the cache without a bespoke codec per entity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::DomainError;
use super::types::{EntityKind, EntityRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: u64,
    pub username: String,
    pub signature: String,
    /// Unix timestamp in seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSnapshot {
    pub id: u64,
    pub title: String,
    pub author_id: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentSnapshot {
    pub id: u64,
    pub content: String,
    pub author_id: u64,
    pub video_id: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    User(UserSnapshot),
    Video(VideoSnapshot),
    Comment(CommentSnapshot),
}

impl Entity {
    pub fn entity_ref(&self) -> EntityRef {
        match self {
            Entity::User(user) => EntityRef::user(user.id),
            Entity::Video(video) => EntityRef::video(video.id),
            Entity::Comment(comment) => EntityRef::comment(comment.id),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.entity_ref().kind
    }

    /// Flatten into a field map suitable for a cached hash.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>, DomainError> {
        let value = serde_json::to_value(self)
            .map_err(|err| DomainError::validation(format!("snapshot encode failed: {err}")))?;
        let Value::Object(map) = value else {
            return Err(DomainError::validation("snapshot did not encode to an object"));
        };
        Ok(map
            .into_iter()
            .map(|(field, value)| (field, value.to_string()))
            .collect())
    }

    /// Rebuild from a field map produced by [`Entity::to_fields`].
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, DomainError> {
        let mut map = Map::with_capacity(fields.len());
        for (field, raw) in fields {
            let value: Value = serde_json::from_str(raw).map_err(|err| {
                DomainError::validation(format!("snapshot field `{field}` is malformed: {err}"))
            })?;
            map.insert(field.clone(), value);
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|err| DomainError::validation(format!("snapshot decode failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_video() -> Entity {
        Entity::Video(VideoSnapshot {
            id: 7,
            title: "sunset".to_string(),
            author_id: 2,
            created_at: 1_700_000_000,
            updated_at: 1_700_000_100,
        })
    }

    #[test]
    fn fields_carry_kind_tag() {
        let fields = sample_video().to_fields().expect("encode");
        assert_eq!(fields.get("kind").map(String::as_str), Some("\"video\""));
        assert_eq!(fields.get("author_id").map(String::as_str), Some("2"));
    }

    #[test]
    fn fields_rebuild_the_entity() {
        let video = sample_video();
        let fields = video.to_fields().expect("encode");
        assert_eq!(Entity::from_fields(&fields).expect("decode"), video);
        assert_eq!(video.entity_ref(), EntityRef::video(7));
    }

    #[test]
    fn malformed_fields_are_validation_errors() {
        let mut fields = sample_video().to_fields().expect("encode");
        fields.insert("author_id".to_string(), "not json".to_string());
        let err = Entity::from_fields(&fields).expect_err("malformed");
        assert!(matches!(err, DomainError::Validation { .. }));
    }
}
