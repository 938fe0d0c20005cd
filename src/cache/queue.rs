//! Write-back queue.
//!
//! In-process FIFO of relation mutations awaiting durable persistence. The
//! queue lives only in memory: a crash between enqueue and flush loses the
//! pending durable write.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::gauge;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::domain::error::DomainError;
use crate::domain::types::{Relation, RelationKind};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::queue";
const METRIC_QUEUE_LEN: &str = "sluice_write_back_queue_len";

/// Monotonic enqueue order within this process.
pub type Epoch = u64;

/// A pending relation mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMessage {
    Favorite {
        user_id: u64,
        video_id: u64,
        favorite: bool,
    },
    Follow {
        user_id: u64,
        follow_id: u64,
        following: bool,
    },
}

impl SyncMessage {
    pub fn new(relation: Relation, desired: bool) -> Self {
        match relation.kind() {
            RelationKind::Favorite => SyncMessage::Favorite {
                user_id: relation.subject(),
                video_id: relation.object(),
                favorite: desired,
            },
            RelationKind::Follow => SyncMessage::Follow {
                user_id: relation.subject(),
                follow_id: relation.object(),
                following: desired,
            },
        }
    }

    pub fn relation(&self) -> Result<Relation, DomainError> {
        match *self {
            SyncMessage::Favorite {
                user_id, video_id, ..
            } => Relation::favorite(user_id, video_id),
            SyncMessage::Follow {
                user_id, follow_id, ..
            } => Relation::follow(user_id, follow_id),
        }
    }

    pub fn desired(&self) -> bool {
        match *self {
            SyncMessage::Favorite { favorite, .. } => favorite,
            SyncMessage::Follow { following, .. } => following,
        }
    }
}

/// Queued message with ordering and idempotency metadata.
#[derive(Debug, Clone)]
pub struct SyncEnvelope {
    pub id: Uuid,
    pub epoch: Epoch,
    pub message: SyncMessage,
    pub enqueued_at: OffsetDateTime,
}

impl SyncEnvelope {
    pub fn new(message: SyncMessage, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            message,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WriteBackQueue {
    queue: Mutex<VecDeque<SyncEnvelope>>,
    epoch_counter: AtomicU64,
}

impl WriteBackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn enqueue(&self, message: SyncMessage) -> Epoch {
        let envelope = SyncEnvelope::new(message, self.next_epoch());
        let epoch = envelope.epoch;

        info!(
            message_id = %envelope.id,
            message_epoch = epoch,
            message = ?message,
            "Write-back message enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "enqueue");
        queue.push_back(envelope);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        epoch
    }

    /// Take everything queued right now, in FIFO order.
    ///
    /// Messages enqueued after this returns wait for the next drain.
    pub fn drain_all(&self) -> Vec<SyncEnvelope> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain_all");
        let drained: Vec<_> = queue.drain(..).collect();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
