//! Shared cache store seam.
//!
//! The engine talks to its volatile store only through [`CacheStore`]. The
//! primitives mirror what a Redis-style server offers: plain reads, bit
//! access, atomic pipelines, and `WATCH`-style optimistic transactions.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Monotonic per-key version observed by [`CacheStore::watch`].
///
/// A missing or expired key reports [`Version::ABSENT`].
/// Largest bit offset accepted by [`CacheStore::get_bit`] and [`Op::SetBit`].
pub const MAX_BIT_OFFSET: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(pub u64);

impl Version {
    pub const ABSENT: Version = Version(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Int(i64),
    Bool(bool),
    /// Bitmap in Redis bit order: offset 0 is the most significant bit of byte 0.
    Bits(Vec<u8>),
    Hash(BTreeMap<String, String>),
    /// Negative-cache placeholder, distinct from any real value.
    Empty,
    /// A reader has claimed the key and is loading it from the durable store.
    Loading,
}

impl CacheValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheValue::Int(_) => "int",
            CacheValue::Bool(_) => "bool",
            CacheValue::Bits(_) => "bits",
            CacheValue::Hash(_) => "hash",
            CacheValue::Empty => "empty",
            CacheValue::Loading => "loading",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("watched key changed before the transaction committed")]
    Conflict,
    #[error("key `{key}` holds a {found} value, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("bit offset {offset} of `{key}` is out of range")]
    BitOffsetOutOfRange { key: String, offset: u64 },
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn wrong_type(key: &str, expected: &'static str, found: &CacheValue) -> Self {
        Self::WrongType {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub fn check_bit_offset(key: &str, offset: u64) -> Result<(), Self> {
        if offset > MAX_BIT_OFFSET {
            return Err(Self::BitOffsetOutOfRange {
                key: key.to_string(),
                offset,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Set {
        key: String,
        value: CacheValue,
        ttl: Option<Duration>,
    },
    /// Adjust an existing integer; absent keys and placeholders are left alone.
    IncrIfPresent { key: String, delta: i64 },
    /// Reset the TTL of an existing key.
    Expire { key: String, ttl: Duration },
    Delete { key: String },
    SetBit {
        key: String,
        offset: u64,
        value: bool,
    },
}

/// Ordered batch of operations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: CacheValue) -> Self {
        self.ops.push(Op::Set {
            key: key.into(),
            value,
            ttl: None,
        });
        self
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: CacheValue, ttl: Duration) -> Self {
        self.ops.push(Op::Set {
            key: key.into(),
            value,
            ttl: Some(ttl),
        });
        self
    }

    pub fn incr_if_present(mut self, key: impl Into<String>, delta: i64) -> Self {
        self.ops.push(Op::IncrIfPresent {
            key: key.into(),
            delta,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.ops.push(Op::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Delete { key: key.into() });
        self
    }

    pub fn set_bit(mut self, key: impl Into<String>, offset: u64, value: bool) -> Self {
        self.ops.push(Op::SetBit {
            key: key.into(),
            offset,
            value,
        });
        self
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>, StoreError>;

    async fn get_bit(&self, key: &str, offset: u64) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Current version of `key`, to be passed back to [`CacheStore::exec_watched`].
    async fn watch(&self, key: &str) -> Result<Version, StoreError>;

    /// Apply every op of `pipeline` atomically.
    async fn exec(&self, pipeline: Pipeline) -> Result<(), StoreError>;

    /// Apply `pipeline` only if every watched key still has the given version.
    ///
    /// Returns [`StoreError::Conflict`] without applying anything otherwise.
    /// An empty pipeline is a pure consistency check.
    async fn exec_watched(
        &self,
        watched: &[(String, Version)],
        pipeline: Pipeline,
    ) -> Result<(), StoreError>;

    async fn set_bit(&self, key: &str, offset: u64, value: bool) -> Result<(), StoreError> {
        self.exec(Pipeline::new().set_bit(key, offset, value)).await
    }

    async fn set_ex(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<(), StoreError> {
        self.exec(Pipeline::new().set_ex(key, value, ttl)).await
    }

    /// Drop expired entries. Stores with native expiry return zero.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
