//! Sync scheduler.
//!
//! Drains the write-back queue into durable batches every `sync_interval`
//! and refreshes ID ceilings on its own period. Flushes never overlap.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use time::OffsetDateTime;
use tracing::{Level, debug, info, instrument, warn};
use uuid::Uuid;

use crate::application::repos::DurableStore;

use super::ceiling::{CeilingCache, CeilingRefresh};
use super::config::CacheConfig;
use super::lock::mutex_lock;
use super::planner::FlushPlan;
use super::queue::WriteBackQueue;
use super::store::CacheStore;

const SOURCE: &str = "cache::scheduler";
const METRIC_FLUSH_MS: &str = "sluice_flush_ms";
const METRIC_FLUSH_DEFICIT: &str = "sluice_flush_deficit_total";

/// Outcome of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Messages taken from the queue.
    pub drained: usize,
    /// Net relation changes sent to the durable store.
    pub attempted: usize,
    pub succeeded: usize,
}

impl FlushReport {
    /// Items that did not reach the durable store.
    pub fn deficit(&self) -> usize {
        self.attempted.saturating_sub(self.succeeded)
    }
}

impl fmt::Display for FlushReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlushReport {{ drained: {}, attempted: {}, succeeded: {}, deficit: {} }}",
            self.drained,
            self.attempted,
            self.succeeded,
            self.deficit()
        )
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct SyncScheduler {
    config: CacheConfig,
    queue: Arc<WriteBackQueue>,
    durable: Arc<dyn DurableStore>,
    ceilings: Arc<CeilingCache>,
    store: Arc<dyn CacheStore>,
    flush_lock: AsyncMutex<()>,
    running: Mutex<Option<Running>>,
}

impl SyncScheduler {
    pub fn new(
        config: CacheConfig,
        queue: Arc<WriteBackQueue>,
        durable: Arc<dyn DurableStore>,
        ceilings: Arc<CeilingCache>,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            config,
            queue,
            durable,
            ceilings,
            store,
            flush_lock: AsyncMutex::new(()),
            running: Mutex::new(None),
        }
    }

    /// Drain the queue and apply the collapsed changes.
    ///
    /// Failed items are logged as a deficit and not requeued.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;
        let started_at = Instant::now();

        let envelopes = self.queue.drain_all();
        if envelopes.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport {
            drained: envelopes.len(),
            ..FlushReport::default()
        };
        let oldest_wait_ms = envelopes
            .iter()
            .map(|e| e.enqueued_at)
            .min()
            .map(|at| (OffsetDateTime::now_utc() - at).whole_milliseconds().max(0))
            .map_or(0, |ms| i64::try_from(ms).unwrap_or(i64::MAX));
        if tracing::enabled!(Level::DEBUG) {
            let message_ids: Vec<Uuid> = envelopes.iter().map(|e| e.id).collect();
            debug!(message_ids = ?message_ids, "Write-back flush messages");
        }
        let plan = FlushPlan::from_envelopes(envelopes);

        info!(
            drained = report.drained,
            oldest_wait_ms,
            plan = %plan,
            "Write-back flush starting"
        );

        for ((kind, op), relations) in &plan.batches {
            report.attempted += relations.len();
            match self.durable.apply_relation_batch(*kind, *op, relations).await {
                Ok(outcome) => {
                    report.succeeded += outcome.applied;
                    for (relation, err) in &outcome.failed {
                        debug!(relation = %relation, op = op.as_str(), error = %err, "Batch item failed");
                    }
                }
                Err(err) => {
                    warn!(
                        kind = %kind,
                        op = op.as_str(),
                        size = relations.len(),
                        error = %err,
                        "Durable batch failed"
                    );
                }
            }
        }

        let deficit = report.deficit();
        if deficit > 0 {
            counter!(METRIC_FLUSH_DEFICIT).increment(deficit as u64);
            warn!(report = %report, "Write-back flush finished with a deficit");
        } else {
            info!(report = %report, "Write-back flush complete");
        }

        histogram!(METRIC_FLUSH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        report
    }

    /// Reload ID ceilings and drop expired cache entries.
    #[instrument(skip(self))]
    pub async fn refresh_ceilings(&self) -> CeilingRefresh {
        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Expired cache entries purged"),
            Err(err) => warn!(error = %err, "Cache purge failed"),
        }
        self.ceilings.refresh().await
    }

    /// Spawn the flush and ceiling loops. A second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = mutex_lock(&self.running, SOURCE, "start");
        if running.is_some() {
            warn!("Sync scheduler already running");
            return;
        }

        let (shutdown, rx) = watch::channel(false);

        let flusher = Arc::clone(self);
        let flush_rx = rx.clone();
        let flush_handle = tokio::spawn(async move {
            let period = flusher.config.sync_interval;
            run_every(period, flush_rx, || {
                let scheduler = Arc::clone(&flusher);
                async move {
                    scheduler.flush().await;
                }
            })
            .await;
        });

        let refresher = Arc::clone(self);
        let ceiling_handle = tokio::spawn(async move {
            let period = refresher.config.ceiling_refresh_interval;
            run_every(period, rx, || {
                let scheduler = Arc::clone(&refresher);
                async move {
                    scheduler.refresh_ceilings().await;
                }
            })
            .await;
        });

        info!(
            sync_interval_ms = self.config.sync_interval.as_millis() as u64,
            ceiling_interval_ms = self.config.ceiling_refresh_interval.as_millis() as u64,
            "Sync scheduler started"
        );
        *running = Some(Running {
            shutdown,
            handles: vec![flush_handle, ceiling_handle],
        });
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.running, SOURCE, "is_running").is_some()
    }

    /// Stop ticking, wait `max_rw_time` for in-flight work, then flush once more.
    pub async fn stop(&self) -> FlushReport {
        let running = mutex_lock(&self.running, SOURCE, "stop").take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            tokio::time::sleep(self.config.max_rw_time).await;
            for handle in running.handles {
                if let Err(err) = handle.await
                    && err.is_panic()
                {
                    warn!(error = %err, "Scheduler loop panicked");
                }
            }
            info!("Sync scheduler stopped");
        }
        self.flush().await
    }
}

async fn run_every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => tick().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
