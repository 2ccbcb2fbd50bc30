//! Historical gap filling via paginated REST requests.
//!
//! Each symbol walks its own cursor backward from the starting instant until
//! the page source runs dry or the requested horizon is crossed. Pages are
//! retried in place with exponential backoff (longer on rate limits) and the
//! exact same cursor parameters, so a throttled request is never silently
//! skipped. Workers are isolated: one symbol exhausting its attempts logs an
//! error and releases its slot without touching its siblings. Writes go
//! through the same idempotent buffer as the live path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::rest::{CandleSource, FetchError};
use crate::store::WriteBuffer;
use crate::types::{Bar, Timeframe};

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub page_limit: usize,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub concurrency: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            max_attempts: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            concurrency: 5,
        }
    }
}

/// Fetch one page, retrying the identical cursor on failure. Rate-limit
/// responses sleep substantially longer than ordinary faults.
async fn fetch_page_with_retry<S: CandleSource>(
    source: &S,
    inst_id: &str,
    after_ms: i64,
    cfg: &BackfillConfig,
) -> Result<Vec<crate::types::Tick>> {
    let mut backoff = cfg.backoff_initial.max(Duration::from_millis(1));
    let max_attempts = cfg.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match source.fetch_older(inst_id, after_ms, cfg.page_limit).await {
            Ok(page) => return Ok(page),
            Err(FetchError::RateLimited) => {
                let wait = (backoff * 5).min(cfg.backoff_cap);
                warn!(
                    symbol = inst_id,
                    attempt, "rate limited, sleeping {:?} before retrying page", wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                warn!(symbol = inst_id, attempt, "page fetch failed: {e}");
                tokio::time::sleep(backoff).await;
            }
        }
        backoff = (backoff * 2).min(cfg.backoff_cap);
    }

    Err(anyhow!(
        "page fetch for {inst_id} failed after {max_attempts} attempts"
    ))
}

/// Walk one symbol's history backward from `start_ms` (exclusive) until the
/// source returns an empty page or the oldest bar crosses `since_ms`. Only
/// confirmed bars are kept. Returns the number of bars enqueued.
pub async fn backfill_symbol<S: CandleSource>(
    source: &S,
    buffer: &WriteBuffer,
    timeframe: Timeframe,
    inst_id: &str,
    since_ms: i64,
    start_ms: i64,
    cfg: &BackfillConfig,
) -> Result<usize> {
    let mut after = start_ms;
    let mut total = 0usize;

    while after > since_ms {
        let page = fetch_page_with_retry(source, inst_id, after, cfg).await?;
        if page.is_empty() {
            break;
        }

        let mut oldest = after;
        for tick in &page {
            oldest = oldest.min(tick.ts_ms);
            if !tick.confirmed {
                // Trailing in-progress bar: the live path owns it.
                continue;
            }
            if tick.ts_ms <= since_ms {
                continue;
            }
            buffer.enqueue(Bar {
                symbol: inst_id.to_string(),
                timeframe,
                bucket_start_ms: timeframe.truncate_ms(tick.ts_ms),
                open: tick.open,
                high: tick.high,
                low: tick.low,
                close: tick.close,
                volume: tick.volume,
            });
            total += 1;
        }

        if oldest >= after {
            // Upstream did not move the cursor; bail rather than spin.
            warn!(symbol = inst_id, after, "page made no progress, stopping");
            break;
        }
        after = oldest - 1;
    }

    Ok(total)
}

/// Backfill every symbol with a bounded worker pool. Worker failures are
/// isolated; the call returns once all workers finish.
pub async fn run_backfill<S: CandleSource + 'static>(
    source: Arc<S>,
    buffer: WriteBuffer,
    timeframe: Timeframe,
    symbols: Vec<String>,
    since_ms: i64,
    start_ms: i64,
    cfg: BackfillConfig,
) {
    let sem = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let mut workers = Vec::with_capacity(symbols.len());

    for symbol in symbols {
        let source = Arc::clone(&source);
        let buffer = buffer.clone();
        let sem = Arc::clone(&sem);
        let cfg = cfg.clone();
        workers.push(tokio::spawn(async move {
            let _permit = sem.acquire().await;
            match backfill_symbol(
                &*source, &buffer, timeframe, &symbol, since_ms, start_ms, &cfg,
            )
            .await
            {
                Ok(total) => info!(symbol = %symbol, total, "backfill done"),
                Err(e) => error!(symbol = %symbol, "backfill abandoned: {e:#}"),
            }
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{open_pool, queries::recent_bars, WriteBufferConfig};
    use crate::types::Tick;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    fn confirmed(ts_ms: i64, close: f64) -> Tick {
        Tick {
            ts_ms,
            open: close - 0.5,
            high: close + 0.5,
            low: close - 1.0,
            close,
            volume: 1.0,
            confirmed: true,
        }
    }

    /// Scripted page source: per symbol, a queue of canned responses; every
    /// call's cursor is recorded.
    #[derive(Default)]
    struct ScriptedSource {
        pages: Mutex<HashMap<String, VecDeque<Result<Vec<Tick>, FetchError>>>>,
        calls: Mutex<Vec<(String, i64)>>,
    }

    impl ScriptedSource {
        fn push(&self, symbol: &str, page: Result<Vec<Tick>, FetchError>) {
            self.pages
                .lock()
                .unwrap()
                .entry(symbol.to_string())
                .or_default()
                .push_back(page);
        }

        fn calls_for(&self, symbol: &str) -> Vec<i64> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == symbol)
                .map(|(_, after)| *after)
                .collect()
        }
    }

    impl CandleSource for ScriptedSource {
        async fn fetch_older(
            &self,
            inst_id: &str,
            after_ms: i64,
            _limit: usize,
        ) -> Result<Vec<Tick>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((inst_id.to_string(), after_ms));
            self.pages
                .lock()
                .unwrap()
                .get_mut(inst_id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn test_buffer() -> (tempfile::TempDir, crate::store::DbPool, WriteBuffer, tokio::task::JoinHandle<()>) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("kline.db"), 2).unwrap();
        let (buffer, task) = WriteBuffer::spawn(
            pool.clone(),
            WriteBufferConfig {
                batch_size: 1000,
                flush_interval: Duration::from_secs(3600),
                max_retries: 1,
            },
        );
        (dir, pool, buffer, task)
    }

    const NOW: i64 = 1_700_000_400_000;

    #[tokio::test]
    async fn terminates_on_empty_page() {
        let (_dir, pool, buffer, task) = test_buffer();
        let src = ScriptedSource::default();
        src.push(
            "BTC-USDT",
            Ok(vec![
                confirmed(NOW - 60_000, 2.0),
                confirmed(NOW - 120_000, 1.0),
            ]),
        );
        // Next call implicitly returns the empty page.

        let cfg = BackfillConfig::default();
        let total = backfill_symbol(&src, &buffer, Timeframe::M1, "BTC-USDT", 0, NOW, &cfg)
            .await
            .unwrap();
        assert_eq!(total, 2);

        let calls = src.calls_for("BTC-USDT");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], NOW);
        // Cursor advanced past the oldest bar of the first page.
        assert_eq!(calls[1], NOW - 120_000 - 1);

        drop(buffer);
        task.await.unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(
            recent_bars(&conn, Timeframe::M1, "BTC-USDT", 10).unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn terminates_once_boundary_is_crossed() {
        let (_dir, _pool, buffer, task) = test_buffer();
        let src = ScriptedSource::default();
        let since = NOW - 120_000;
        // Page reaches past the boundary; older bar must be skipped and the
        // loop must not request another page.
        src.push(
            "BTC-USDT",
            Ok(vec![
                confirmed(NOW - 60_000, 2.0),
                confirmed(since - 60_000, 1.0),
            ]),
        );

        let cfg = BackfillConfig::default();
        let total = backfill_symbol(&src, &buffer, Timeframe::M1, "BTC-USDT", since, NOW, &cfg)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(src.calls_for("BTC-USDT").len(), 1);

        drop(buffer);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_identical_cursor() {
        let (_dir, _pool, buffer, task) = test_buffer();
        let src = ScriptedSource::default();
        src.push("BTC-USDT", Err(FetchError::RateLimited));
        src.push("BTC-USDT", Ok(vec![confirmed(NOW - 60_000, 2.0)]));

        let cfg = BackfillConfig::default();
        let total = backfill_symbol(&src, &buffer, Timeframe::M1, "BTC-USDT", 0, NOW, &cfg)
            .await
            .unwrap();
        assert_eq!(total, 1);

        let calls = src.calls_for("BTC-USDT");
        // First page requested, throttled, and re-requested with the same
        // cursor; only then does the cursor advance.
        assert!(calls.len() >= 3);
        assert_eq!(calls[0], calls[1]);
        assert_eq!(calls[2], NOW - 60_000 - 1);

        drop(buffer);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exhausted_abandons_symbol() {
        let (_dir, _pool, buffer, task) = test_buffer();
        let src = ScriptedSource::default();
        for _ in 0..5 {
            src.push(
                "BTC-USDT",
                Err(FetchError::Upstream {
                    code: "51001".to_string(),
                    msg: "bad instrument".to_string(),
                }),
            );
        }

        let cfg = BackfillConfig::default();
        let res = backfill_symbol(&src, &buffer, Timeframe::M1, "BTC-USDT", 0, NOW, &cfg).await;
        assert!(res.is_err());
        assert_eq!(src.calls_for("BTC-USDT").len(), 5);

        drop(buffer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unconfirmed_bars_are_discarded() {
        let (_dir, pool, buffer, task) = test_buffer();
        let src = ScriptedSource::default();
        let mut partial = confirmed(NOW - 60_000, 3.0);
        partial.confirmed = false;
        src.push(
            "BTC-USDT",
            Ok(vec![partial, confirmed(NOW - 120_000, 2.0)]),
        );

        let cfg = BackfillConfig::default();
        let total = backfill_symbol(&src, &buffer, Timeframe::M1, "BTC-USDT", 0, NOW, &cfg)
            .await
            .unwrap();
        assert_eq!(total, 1);

        drop(buffer);
        task.await.unwrap();
        let conn = pool.get().unwrap();
        let bars = recent_bars(&conn, Timeframe::M1, "BTC-USDT", 10).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_worker_does_not_cancel_siblings() {
        let (_dir, pool, buffer, task) = test_buffer();
        let src = Arc::new(ScriptedSource::default());
        for _ in 0..5 {
            src.push(
                "BAD-USDT",
                Err(FetchError::Upstream {
                    code: "51001".to_string(),
                    msg: "bad instrument".to_string(),
                }),
            );
        }
        src.push("GOOD-USDT", Ok(vec![confirmed(NOW - 60_000, 7.0)]));

        run_backfill(
            Arc::clone(&src),
            buffer.clone(),
            Timeframe::M1,
            vec!["BAD-USDT".to_string(), "GOOD-USDT".to_string()],
            0,
            NOW,
            BackfillConfig::default(),
        )
        .await;

        drop(buffer);
        task.await.unwrap();
        let conn = pool.get().unwrap();
        let bars = recent_bars(&conn, Timeframe::M1, "GOOD-USDT", 10).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 7.0);
    }
}
