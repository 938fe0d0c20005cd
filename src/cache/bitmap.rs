//! Relation bitmaps: one bitmap per subject, one bit per object id.

use std::sync::Arc;

use crate::domain::types::Relation;

use super::keys::CacheKey;
use super::store::{CacheStore, StoreError};

#[derive(Clone)]
pub struct BitmapStore {
    store: Arc<dyn CacheStore>,
}

impl BitmapStore {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn key(relation: Relation) -> String {
        CacheKey::bitmap(relation.kind(), relation.subject()).to_string()
    }

    pub async fn get(&self, relation: Relation) -> Result<bool, StoreError> {
        self.store
            .get_bit(&Self::key(relation), relation.object())
            .await
    }

    pub async fn set(&self, relation: Relation, value: bool) -> Result<(), StoreError> {
        self.store
            .set_bit(&Self::key(relation), relation.object(), value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryStore;
    use crate::cache::store::CacheValue;

    #[tokio::test]
    async fn bits_are_scoped_by_subject_and_kind() {
        let store = Arc::new(MemoryStore::new());
        let bitmaps = BitmapStore::new(store.clone());
        let follow = Relation::follow(1, 10).expect("relation");
        let favorite = Relation::favorite(1, 10).expect("relation");

        bitmaps.set(follow, true).await.expect("set");

        assert!(bitmaps.get(follow).await.expect("get"));
        assert!(!bitmaps.get(favorite).await.expect("get"));
        assert!(!bitmaps.get(Relation::follow(2, 10).expect("relation")).await.expect("get"));
        assert_eq!(
            store.get("user:flw:1").await.expect("raw"),
            Some(CacheValue::Bits(vec![0, 0b0010_0000]))
        );
    }
}
