use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::VolumeMode;

/// Pipeline configuration derived from environment variables (`KLINE_*`).
#[derive(Debug, Clone)]
pub struct Config {
    // ── Upstream endpoints ─────────────────────────────────────────
    pub ws_url: String,
    pub rest_url: String,

    // ── Symbol universe ────────────────────────────────────────────
    pub symbols: Vec<String>,
    pub channel: String,

    // ── Feed connection ────────────────────────────────────────────
    pub idle_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_cap: Duration,
    pub volume_mode: VolumeMode,

    // ── Storage ────────────────────────────────────────────────────
    pub db_path: PathBuf,
    pub db_pool_size: u32,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub write_retries: u32,

    // ── Backfill ───────────────────────────────────────────────────
    pub backfill_enable: bool,
    pub backfill_days: u64,
    pub backfill_page_limit: usize,
    pub backfill_max_attempts: u32,
    pub backfill_concurrency: usize,
    pub rest_min_gap: Duration,
    pub rest_timeout: Duration,
}

fn env_str(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|s| {
            matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "y" | "on"
            )
        })
        .unwrap_or(default)
}

/// Split a CSV symbol list: trimmed, upper-cased, de-duplicated, order kept.
pub fn parse_symbols_csv(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for part in raw.split(',') {
        let s = part.trim().to_ascii_uppercase();
        if s.is_empty() {
            continue;
        }
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

impl Config {
    pub fn from_env() -> Self {
        let ws_url = env_str("KLINE_WS_URL", "wss://ws.okx.com:8443/ws/v5/business");
        let rest_url = env_str("KLINE_REST_URL", "https://www.okx.com");

        let symbols = parse_symbols_csv(&env_str("KLINE_SYMBOLS", "BTC-USDT,ETH-USDT"));
        let channel = env_str("KLINE_CHANNEL", "candle1m");

        let idle_timeout = Duration::from_secs(env_u64("KLINE_IDLE_TIMEOUT_SECS", 25).max(5));
        let reconnect_initial =
            Duration::from_secs(env_u64("KLINE_RECONNECT_INITIAL_SECS", 1).max(1));
        let reconnect_cap = Duration::from_secs(env_u64("KLINE_RECONNECT_CAP_SECS", 32).max(1));
        let volume_mode = VolumeMode::parse(&env_str("KLINE_VOLUME_MODE", "snapshot"))
            .unwrap_or(VolumeMode::Snapshot);

        let db_path = PathBuf::from(env_str("KLINE_DB_PATH", "kline.db"));
        let db_pool_size = env_u32("KLINE_DB_POOL_SIZE", 4).max(1);
        let batch_size = env_usize("KLINE_BATCH_SIZE", 200).max(1);
        let flush_interval =
            Duration::from_millis(env_u64("KLINE_FLUSH_INTERVAL_MS", 2000).max(100));
        let write_retries = env_u32("KLINE_WRITE_RETRIES", 3).max(1);

        let backfill_enable = env_bool("KLINE_BACKFILL_ENABLE", true);
        let backfill_days = env_u64("KLINE_BACKFILL_DAYS", 90).max(1);
        // The upstream caps history pages at 100 rows.
        let backfill_page_limit = env_usize("KLINE_BACKFILL_PAGE_LIMIT", 100).clamp(1, 100);
        let backfill_max_attempts = env_u32("KLINE_BACKFILL_MAX_ATTEMPTS", 5).max(1);
        let backfill_concurrency = env_usize("KLINE_BACKFILL_CONCURRENCY", 5).max(1);
        let rest_min_gap = Duration::from_millis(env_u64("KLINE_REST_MIN_GAP_MS", 100));
        let rest_timeout = Duration::from_secs(env_u64("KLINE_REST_TIMEOUT_SECS", 10).max(1));

        Self {
            ws_url,
            rest_url,
            symbols,
            channel,
            idle_timeout,
            reconnect_initial,
            reconnect_cap,
            volume_mode,
            db_path,
            db_pool_size,
            batch_size,
            flush_interval,
            write_retries,
            backfill_enable,
            backfill_days,
            backfill_page_limit,
            backfill_max_attempts,
            backfill_concurrency,
            rest_min_gap,
            rest_timeout,
        }
    }
}
