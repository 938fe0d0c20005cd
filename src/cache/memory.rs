//! In-process [`CacheStore`] backed by a locked hash map.
//!
//! Expiry is measured on the tokio clock so tests can drive TTLs with paused
//! time. Every successful mutation bumps the key's version; a missing or
//! expired key always reports [`Version::ABSENT`].

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::lock::{rw_read, rw_write};
use super::store::{CacheStore, CacheValue, Op, Pipeline, StoreError, Version};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    expires_at: Option<Instant>,
    version: u64,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    clock: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining lifetime of `key`, `None` for absent or persistent keys.
    pub fn ttl(&self, key: &str) -> Option<std::time::Duration> {
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "ttl");
        entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        rw_read(&self.entries, SOURCE, "len")
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Entry> {
        entries.get(key).filter(|entry| entry.is_live(now))
    }

    fn validate(entries: &HashMap<String, Entry>, ops: &[Op], now: Instant) -> Result<(), StoreError> {
        for op in ops {
            match op {
                Op::IncrIfPresent { key, .. } => {
                    if let Some(entry) = Self::live(entries, key, now)
                        && !matches!(entry.value, CacheValue::Int(_) | CacheValue::Empty)
                    {
                        return Err(StoreError::wrong_type(key, "int", &entry.value));
                    }
                }
                Op::SetBit { key, offset, .. } => {
                    StoreError::check_bit_offset(key, *offset)?;
                    if let Some(entry) = Self::live(entries, key, now)
                        && !matches!(entry.value, CacheValue::Bits(_))
                    {
                        return Err(StoreError::wrong_type(key, "bits", &entry.value));
                    }
                }
                Op::Set { .. } | Op::Expire { .. } | Op::Delete { .. } => {}
            }
        }
        Ok(())
    }

    fn apply(&self, entries: &mut HashMap<String, Entry>, op: Op, now: Instant) {
        match op {
            Op::Set { key, value, ttl } => {
                let version = self.next_version();
                entries.insert(
                    key,
                    Entry {
                        value,
                        expires_at: ttl.map(|ttl| now + ttl),
                        version,
                    },
                );
            }
            Op::IncrIfPresent { key, delta } => {
                let version = self.next_version();
                if let Some(entry) = entries.get_mut(&key).filter(|entry| entry.is_live(now))
                    && let CacheValue::Int(current) = &mut entry.value
                {
                    *current += delta;
                    entry.version = version;
                }
            }
            Op::Expire { key, ttl } => {
                let version = self.next_version();
                if let Some(entry) = entries.get_mut(&key).filter(|entry| entry.is_live(now)) {
                    entry.expires_at = Some(now + ttl);
                    entry.version = version;
                }
            }
            Op::Delete { key } => {
                entries.remove(&key);
            }
            Op::SetBit { key, offset, value } => {
                let version = self.next_version();
                let live = entries.get(&key).is_some_and(|entry| entry.is_live(now));
                if !live {
                    entries.remove(&key);
                }
                let entry = entries.entry(key).or_insert_with(|| Entry {
                    value: CacheValue::Bits(Vec::new()),
                    expires_at: None,
                    version,
                });
                if let CacheValue::Bits(bits) = &mut entry.value {
                    write_bit(bits, offset, value);
                }
                entry.version = version;
            }
        }
    }
}

pub(crate) fn read_bit(bits: &[u8], offset: u64) -> bool {
    let byte = (offset / 8) as usize;
    let mask = 0x80u8 >> (offset % 8);
    bits.get(byte).is_some_and(|b| b & mask != 0)
}

pub(crate) fn write_bit(bits: &mut Vec<u8>, offset: u64, value: bool) {
    let byte = (offset / 8) as usize;
    let mask = 0x80u8 >> (offset % 8);
    if bits.len() <= byte {
        if !value {
            return;
        }
        bits.resize(byte + 1, 0);
    }
    if value {
        bits[byte] |= mask;
    } else {
        bits[byte] &= !mask;
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>, StoreError> {
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "get");
        Ok(Self::live(&entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, StoreError> {
        StoreError::check_bit_offset(key, offset)?;
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "get_bit");
        match Self::live(&entries, key, now).map(|entry| &entry.value) {
            None => Ok(false),
            Some(CacheValue::Bits(bits)) => Ok(read_bit(bits, offset)),
            Some(other) => Err(StoreError::wrong_type(key, "bits", other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn watch(&self, key: &str) -> Result<Version, StoreError> {
        let now = Instant::now();
        let entries = rw_read(&self.entries, SOURCE, "watch");
        Ok(Self::live(&entries, key, now)
            .map(|entry| Version(entry.version))
            .unwrap_or(Version::ABSENT))
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "exec");
        Self::validate(&entries, pipeline.ops(), now)?;
        for op in pipeline.into_ops() {
            self.apply(&mut entries, op, now);
        }
        Ok(())
    }

    async fn exec_watched(
        &self,
        watched: &[(String, Version)],
        pipeline: Pipeline,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "exec_watched");
        for (key, expected) in watched {
            let current = Self::live(&entries, key, now)
                .map(|entry| Version(entry.version))
                .unwrap_or(Version::ABSENT);
            if current != *expected {
                debug!(key = %key, "Watched key changed, aborting transaction");
                return Err(StoreError::Conflict);
            }
        }
        Self::validate(&entries, pipeline.ops(), now)?;
        for op in pipeline.into_ops() {
            self.apply(&mut entries, op, now);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "purge_expired");
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_with_ttl_expires_on_tokio_clock() {
        let store = MemoryStore::new();
        store
            .set_ex("k", CacheValue::Int(3), Duration::from_secs(5))
            .await
            .expect("set");

        assert_eq!(store.get("k").await.expect("get"), Some(CacheValue::Int(3)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.expect("get"), None);
        assert_eq!(store.purge_expired().await.expect("purge"), 1);
    }

    #[tokio::test]
    async fn incr_if_present_skips_absent_and_placeholder_keys() {
        let store = MemoryStore::new();
        store
            .exec(
                Pipeline::new()
                    .set("counted", CacheValue::Int(10))
                    .set("placeholder", CacheValue::Empty),
            )
            .await
            .expect("seed");

        store
            .exec(
                Pipeline::new()
                    .incr_if_present("counted", 1)
                    .incr_if_present("placeholder", 1)
                    .incr_if_present("missing", 1),
            )
            .await
            .expect("incr");

        assert_eq!(store.get("counted").await.expect("get"), Some(CacheValue::Int(11)));
        assert_eq!(store.get("placeholder").await.expect("get"), Some(CacheValue::Empty));
        assert_eq!(store.get("missing").await.expect("get"), None);
    }

    #[tokio::test]
    async fn bits_use_most_significant_bit_first() {
        let store = MemoryStore::new();
        store.set_bit("b", 0, true).await.expect("bit 0");
        store.set_bit("b", 9, true).await.expect("bit 9");

        assert_eq!(
            store.get("b").await.expect("get"),
            Some(CacheValue::Bits(vec![0b1000_0000, 0b0100_0000]))
        );
        assert!(store.get_bit("b", 9).await.expect("get_bit"));
        assert!(!store.get_bit("b", 1_000).await.expect("get_bit beyond end"));

        store.set_bit("b", 9, false).await.expect("clear");
        assert!(!store.get_bit("b", 9).await.expect("get_bit"));
    }

    #[tokio::test]
    async fn bit_offsets_beyond_the_limit_are_rejected() {
        use crate::cache::store::MAX_BIT_OFFSET;

        let store = MemoryStore::new();
        let err = store
            .exec(
                Pipeline::new()
                    .set("other", CacheValue::Int(1))
                    .set_bit("b", 1 << 62, true),
            )
            .await
            .expect_err("huge offset");
        assert!(matches!(err, StoreError::BitOffsetOutOfRange { offset, .. } if offset == 1 << 62));
        assert_eq!(store.get("other").await.expect("get"), None);
        assert_eq!(store.get("b").await.expect("get"), None);

        let err = store
            .get_bit("b", MAX_BIT_OFFSET + 1)
            .await
            .expect_err("read beyond limit");
        assert!(matches!(err, StoreError::BitOffsetOutOfRange { .. }));
        assert!(!store.get_bit("b", MAX_BIT_OFFSET).await.expect("largest offset"));
    }

    #[tokio::test]
    async fn watched_exec_fails_after_concurrent_write() {
        let store = MemoryStore::new();
        let seen = store.watch("k").await.expect("watch");
        assert_eq!(seen, Version::ABSENT);

        store
            .exec(Pipeline::new().set("k", CacheValue::Bool(true)))
            .await
            .expect("interleaved write");

        let err = store
            .exec_watched(
                &[("k".to_string(), seen)],
                Pipeline::new().set("k", CacheValue::Bool(false)),
            )
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict));
        assert_eq!(store.get("k").await.expect("get"), Some(CacheValue::Bool(true)));
    }

    #[tokio::test]
    async fn failed_validation_applies_nothing() {
        let store = MemoryStore::new();
        store
            .exec(Pipeline::new().set("bits", CacheValue::Bool(true)))
            .await
            .expect("seed");

        let err = store
            .exec(
                Pipeline::new()
                    .set("other", CacheValue::Int(1))
                    .set_bit("bits", 1, true),
            )
            .await
            .expect_err("wrong type");
        assert!(matches!(err, StoreError::WrongType { .. }));
        assert_eq!(store.get("other").await.expect("get"), None);
    }
}
