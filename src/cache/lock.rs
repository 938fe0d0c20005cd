//! Poison-tolerant guards for the in-process stores.
//!
//! A panic while a guard is held poisons the lock; the engine keeps serving
//! from the recovered state and reports every recovery.

use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::counter;
use tracing::warn;

const METRIC_LOCK_POISONED: &str = "sluice_lock_poisoned_total";

fn recover<G>(
    result: LockResult<G>,
    source: &'static str,
    op: &'static str,
    kind: &'static str,
) -> G {
    result.unwrap_or_else(|poisoned| {
        counter!(METRIC_LOCK_POISONED, "source" => source, "lock" => kind).increment(1);
        warn!(source, op, lock = kind, "Recovered poisoned lock, state may be stale");
        poisoned.into_inner()
    })
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    recover(lock.read(), source, op, "read")
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    source: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    recover(lock.write(), source, op, "write")
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    recover(lock.lock(), source, op, "mutex")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use metrics_util::debugging::DebuggingRecorder;

    use super::*;

    #[test]
    fn poisoned_mutex_keeps_its_last_state() {
        let lock = Arc::new(Mutex::new(vec![1]));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let mut guard = mutex_lock(&poisoner, "cache::lock", "poison");
            guard.push(2);
            panic!("poison the queue");
        })
        .join();

        assert!(lock.is_poisoned());
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let state = metrics::with_local_recorder(&recorder, || {
            mutex_lock(&lock, "cache::lock", "read_back").clone()
        });
        assert_eq!(state, vec![1, 2]);

        let recorded: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        assert_eq!(recorded, vec![METRIC_LOCK_POISONED.to_string()]);
    }

    #[test]
    fn poisoned_rwlock_serves_reads_and_writes() {
        let lock = Arc::new(RwLock::new(0_u64));
        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let mut guard = rw_write(&poisoner, "cache::lock", "poison");
            *guard = 7;
            panic!("poison the map");
        })
        .join();

        *rw_write(&lock, "cache::lock", "bump") += 1;
        assert_eq!(*rw_read(&lock, "cache::lock", "get"), 8);
    }
}
