//! Cache key layout.
//!
//! The string form is shared with existing deployments, so prefixes and the
//! base-36 id rendering must stay stable.

use std::fmt;

use crate::domain::types::{CounterKind, EntityKind, Relation, RelationKind};

/// Every key the engine writes to the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Per-subject bitmap over object ids.
    Bitmap { kind: RelationKind, subject: u64 },
    /// Pending relation mutation.
    Ledger(Relation),
    Counter { kind: CounterKind, id: u64 },
    Snapshot { kind: EntityKind, id: u64 },
    Ceiling(EntityKind),
}

impl CacheKey {
    pub fn bitmap(kind: RelationKind, subject: u64) -> Self {
        Self::Bitmap { kind, subject }
    }

    pub fn counter(kind: CounterKind, id: u64) -> Self {
        Self::Counter { kind, id }
    }

    pub fn snapshot(kind: EntityKind, id: u64) -> Self {
        Self::Snapshot { kind, id }
    }
}

fn relation_prefix(kind: RelationKind) -> &'static str {
    match kind {
        RelationKind::Follow => "user:flw:",
        RelationKind::Favorite => "user:fav:",
    }
}

fn counter_prefix(kind: CounterKind) -> &'static str {
    match kind {
        CounterKind::UserWorks => "user:wrk:count:",
        CounterKind::UserFavorites => "user:fav:count:",
        CounterKind::UserFavorited => "user:fav:dcount:",
        CounterKind::UserFollows => "user:flw:count:",
        CounterKind::UserFollowers => "user:flw:dcount:",
        CounterKind::UserComments => "user:cmt:count:",
        CounterKind::VideoFavorited => "video:fav:dcount:",
        CounterKind::VideoComments => "video:cmt:count:",
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Bitmap { kind, subject } => {
                write!(f, "{}{}", relation_prefix(*kind), base36(*subject))
            }
            CacheKey::Ledger(relation) => write!(
                f,
                "{}delta:{}:{}",
                relation_prefix(relation.kind()),
                base36(relation.subject()),
                base36(relation.object())
            ),
            CacheKey::Counter { kind, id } => write!(f, "{}{}", counter_prefix(*kind), base36(*id)),
            CacheKey::Snapshot { kind, id } => write!(f, "{}:bsc:{}", kind.as_str(), base36(*id)),
            CacheKey::Ceiling(kind) => write!(f, "{}:max", kind.as_str()),
        }
    }
}

/// Lowercase base-36 rendering of an id.
pub fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    buf.into_iter().map(char::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_matches_known_values() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(u64::MAX), "3w5e11264sgsf");
    }

    #[test]
    fn relation_keys() {
        let favorite = Relation::favorite(1, 71).expect("relation");
        assert_eq!(CacheKey::Ledger(favorite).to_string(), "user:fav:delta:1:1z");
        assert_eq!(
            CacheKey::bitmap(RelationKind::Follow, 36).to_string(),
            "user:flw:10"
        );
    }

    #[test]
    fn counter_snapshot_and_ceiling_keys() {
        assert_eq!(
            CacheKey::counter(CounterKind::VideoFavorited, 7).to_string(),
            "video:fav:dcount:7"
        );
        assert_eq!(
            CacheKey::counter(CounterKind::UserFollowers, 10).to_string(),
            "user:flw:dcount:a"
        );
        assert_eq!(
            CacheKey::snapshot(EntityKind::Comment, 11).to_string(),
            "comment:bsc:b"
        );
        assert_eq!(CacheKey::Ceiling(EntityKind::Message).to_string(), "message:max");
    }
}
