//! Sluice cache-consistency engine.
//!
//! Keeps a shared volatile store consistent with the durable store:
//!
//! - **Relations**: delta ledger + per-subject bitmaps, with sampled durable
//!   bypass and read-repair
//! - **Counters / snapshots**: read-through with negative caching and
//!   double-delete invalidation
//! - **Write-back**: in-process queue flushed by the sync scheduler
//! - **ID ceilings**: coarse per-kind upper bounds
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! sync_interval_seconds = 10
//! max_rw_time_ms = 1000
//! cache_expiration_seconds = 600
//! empty_expiration_seconds = 30
//! distrust_probability = 0.01
//! ceiling_refresh_interval_seconds = 60
//! ```

mod bitmap;
mod ceiling;
mod config;
mod counter;
mod engine;
mod error;
mod keys;
mod ledger;
pub(crate) mod lock;
mod memory;
mod planner;
mod queue;
mod relation;
mod scheduler;
mod snapshot;
mod store;
mod tasks;

pub use ceiling::{CeilingCheck, CeilingRefresh};
pub use config::CacheConfig;
pub use counter::Count;
pub use engine::CacheEngine;
pub use error::CacheError;
pub use keys::{CacheKey, base36};
pub use memory::MemoryStore;
pub use planner::FlushPlan;
pub use queue::{Epoch, SyncEnvelope, SyncMessage, WriteBackQueue};
pub use relation::{ReadSource, RelationRead};
pub use scheduler::FlushReport;
pub use store::{CacheStore, CacheValue, Op, Pipeline, StoreError, Version};
