//! The single background worker that drains the record queue into SQLite.
//! Failures stay inside this module; the data plane never sees them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use dproxy_core::queue::RecordQueue;
use dproxy_core::record::InteractionRecord;

use crate::store::InteractionStore;

static DROPPED_BATCHES: AtomicU64 = AtomicU64::new(0);

pub fn dropped_batches() -> u64 {
    DROPPED_BATCHES.load(Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_backoff: Vec<Duration>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            retry_backoff: vec![
                Duration::from_millis(50),
                Duration::from_millis(250),
                Duration::from_secs(1),
            ],
        }
    }
}

pub fn spawn_writer(
    store: InteractionStore,
    queue: Arc<RecordQueue>,
    config: WriterConfig,
) -> JoinHandle<()> {
    tokio::spawn(writer_loop(store, queue, config))
}

async fn writer_loop(store: InteractionStore, queue: Arc<RecordQueue>, config: WriterConfig) {
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = queue.notified() => {}
            _ = ticker.tick() => {}
        }

        loop {
            let batch = queue.drain(config.batch_size);
            if batch.is_empty() {
                break;
            }
            commit_batch(&store, batch, &config.retry_backoff).await;
        }
    }
}

async fn commit_batch(
    store: &InteractionStore,
    batch: Vec<InteractionRecord>,
    backoff: &[Duration],
) {
    let size = batch.len();
    let mut attempt = 0usize;
    loop {
        match store.insert_batch(batch.clone()).await {
            Ok(()) => {
                debug!(event = "interactions_committed", rows = size);
                return;
            }
            Err(err) if attempt < backoff.len() => {
                warn!(
                    event = "interactions_commit_retry",
                    attempt = attempt + 1,
                    rows = size,
                    error = %err
                );
                tokio::time::sleep(backoff[attempt]).await;
                attempt += 1;
            }
            Err(err) => {
                let dropped = DROPPED_BATCHES.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event = "interactions_batch_dropped",
                    rows = size,
                    dropped_batches = dropped,
                    error = %err
                );
                return;
            }
        }
    }
}

/// Shutdown path: push whatever is still queued into the store, one final
/// batch at a time.
pub async fn flush_remaining(store: &InteractionStore, queue: &RecordQueue, batch_size: usize) {
    loop {
        let batch = queue.drain(batch_size);
        if batch.is_empty() {
            return;
        }
        if let Err(err) = store.insert_batch(batch).await {
            warn!(event = "interactions_final_flush_failed", error = %err);
            return;
        }
    }
}
