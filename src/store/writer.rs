//! Durable write buffer: batches finalized bars in memory and flushes them
//! with an idempotent `INSERT OR IGNORE`, keyed (symbol, bucket_start) per
//! timeframe table. Confirmed bars are immutable once stored, so the first
//! writer wins and replays are no-ops.
//!
//! One flush task drains the queue; producers enqueue from the message path
//! and from backfill workers. A flush happens when the pending batch reaches
//! the size threshold or the flush interval elapses, whichever comes first.
//! Failed batches are retried with a fresh pooled connection a bounded number
//! of times, then dropped with an error log; the backfill path is the
//! recovery mechanism for such gaps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::pool::DbPool;
use crate::types::Bar;

#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            flush_interval: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

/// Cloneable producer handle. Dropping every handle shuts the flush task
/// down after a final drain, which is how graceful shutdown lets queued bars
/// reach storage.
#[derive(Clone)]
pub struct WriteBuffer {
    tx: mpsc::UnboundedSender<Bar>,
}

impl WriteBuffer {
    /// Start the flush task and hand back the producer side.
    pub fn spawn(pool: DbPool, cfg: WriteBufferConfig) -> (WriteBuffer, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(flush_loop(pool, cfg, rx));
        (WriteBuffer { tx }, handle)
    }

    pub fn enqueue(&self, bar: Bar) {
        if self.tx.send(bar).is_err() {
            warn!("write buffer is shut down, bar dropped");
        }
    }
}

async fn flush_loop(pool: DbPool, cfg: WriteBufferConfig, mut rx: mpsc::UnboundedReceiver<Bar>) {
    let batch_size = cfg.batch_size.max(1);
    let mut pending: Vec<Bar> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(cfg.flush_interval.max(Duration::from_millis(10)));
    tick.tick().await; // arm

    loop {
        tokio::select! {
            bar = rx.recv() => {
                match bar {
                    Some(bar) => {
                        pending.push(bar);
                        if pending.len() >= batch_size {
                            flush_batch(&pool, &cfg, std::mem::take(&mut pending)).await;
                        }
                    }
                    None => {
                        // All producers gone: drain and exit.
                        if !pending.is_empty() {
                            flush_batch(&pool, &cfg, std::mem::take(&mut pending)).await;
                        }
                        debug!("write buffer flush task exiting");
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    flush_batch(&pool, &cfg, std::mem::take(&mut pending)).await;
                }
            }
        }
    }
}

async fn flush_batch(pool: &DbPool, cfg: &WriteBufferConfig, batch: Vec<Bar>) {
    let total = batch.len();
    let batch = Arc::new(batch);

    for attempt in 1..=cfg.max_retries.max(1) {
        let pool = pool.clone();
        let batch2 = Arc::clone(&batch);
        let res = tokio::task::spawn_blocking(move || write_batch(&pool, &batch2)).await;

        match res {
            Ok(Ok(inserted)) => {
                debug!(total, inserted, "flushed bar batch");
                return;
            }
            Ok(Err(e)) => {
                warn!(attempt, total, "bar batch write failed: {e:#}");
            }
            Err(e) => {
                warn!(attempt, total, "bar batch write task failed: {e}");
            }
        }

        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
    }

    // Bounded loss: the backfill path repairs the hole.
    error!(total, "dropping bar batch after retries exhausted");
}

/// Write one batch in a single transaction. Returns the number of rows
/// actually inserted (conflicting identities are ignored).
fn write_batch(pool: &DbPool, batch: &[Bar]) -> Result<usize> {
    let mut conn = pool.get().context("acquire db connection")?;
    let tx = conn.transaction().context("begin flush transaction")?;
    let updated_at = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let mut inserted = 0usize;
    for bar in batch {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (symbol, bucket_start, open, high, low, close, volume, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            bar.timeframe.table()
        );
        let mut stmt = tx.prepare_cached(&sql).context("prepare upsert")?;
        inserted += stmt
            .execute((
                &bar.symbol,
                bar.bucket_start_ms,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
                &updated_at,
            ))
            .context("execute upsert")?;
    }

    tx.commit().context("commit flush transaction")?;
    Ok(inserted)
}
