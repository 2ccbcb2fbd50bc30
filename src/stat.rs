//! Offline inspection of a candle table: row count, covered range, missing
//! buckets, ordering sanity and freshness. Runs against the DB file directly
//! so it can be used while the pipeline is down.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde_json::json;

use crate::store::ensure_schema;
use crate::types::Timeframe;

#[derive(Debug, Default)]
pub struct TableStat {
    pub symbol: String,
    pub timeframe: String,
    pub rows: usize,
    pub min_bucket: Option<i64>,
    pub max_bucket: Option<i64>,
    pub gap_bars: i64,
    pub max_gap_bars: i64,
    pub out_of_order: bool,
    pub last_close_age_s: Option<f64>,
}

fn now_ms_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn compute_stat(
    db_path: &Path,
    timeframe: Timeframe,
    symbol: &str,
    bars_wanted: usize,
) -> Result<TableStat> {
    let sym_u = symbol.trim().to_ascii_uppercase();

    let mut st = TableStat {
        symbol: sym_u.clone(),
        timeframe: timeframe.label().to_string(),
        ..TableStat::default()
    };

    let conn = Connection::open(db_path).context("open candle db")?;
    conn.busy_timeout(Duration::from_secs(30))
        .context("set busy timeout")?;
    ensure_schema(&conn)?;

    let limit = bars_wanted.saturating_add(500).max(100);
    let mut stmt = conn.prepare(&format!(
        "SELECT bucket_start FROM {} WHERE symbol = ?1 ORDER BY bucket_start DESC LIMIT ?2",
        timeframe.table()
    ))?;
    let mut buckets: Vec<i64> = stmt
        .query_map((sym_u, limit as i64), |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;

    if buckets.is_empty() {
        return Ok(st);
    }
    buckets.reverse();

    st.rows = buckets.len();
    st.min_bucket = buckets.first().copied();
    st.max_bucket = buckets.last().copied();

    let period_ms = timeframe.period_ms();
    let mut prev: Option<i64> = None;
    for b in &buckets {
        if let Some(p) = prev {
            if *b <= p {
                st.out_of_order = true;
            } else {
                let steps = (*b - p) / period_ms;
                if steps > 1 {
                    let missing = steps - 1;
                    st.gap_bars += missing;
                    if missing > st.max_gap_bars {
                        st.max_gap_bars = missing;
                    }
                }
            }
        }
        prev = Some(*b);
    }

    if let Some(max_bucket) = st.max_bucket {
        let last_close = max_bucket + period_ms;
        st.last_close_age_s = Some(((now_ms_i64() - last_close).max(0) as f64) / 1000.0);
    }

    Ok(st)
}

pub fn print_stat_human(st: &TableStat, bars_wanted: usize) {
    let bars_ok = st.rows >= bars_wanted;
    let gaps_ok = st.gap_bars == 0 && !st.out_of_order;
    println!(
        "{} {} rows={} want>={} bars_ok={} gaps={} max_gap={} out_of_order={} last_close_age_s={:.1} min={:?} max={:?}",
        st.symbol,
        st.timeframe,
        st.rows,
        bars_wanted,
        if bars_ok { "yes" } else { "no" },
        st.gap_bars,
        st.max_gap_bars,
        st.out_of_order,
        st.last_close_age_s.unwrap_or(f64::INFINITY),
        st.min_bucket,
        st.max_bucket,
    );
}

pub fn stat_to_json(st: &TableStat, bars_wanted: usize) -> serde_json::Value {
    json!({
        "symbol": st.symbol,
        "timeframe": st.timeframe,
        "rows": st.rows,
        "bars_wanted": bars_wanted,
        "min_bucket": st.min_bucket,
        "max_bucket": st.max_bucket,
        "gap_bars": st.gap_bars,
        "max_gap_bars": st.max_gap_bars,
        "out_of_order": st.out_of_order,
        "last_close_age_s": st.last_close_age_s,
    })
}

/// `--key value` / `--flag` argument parsing, no positional arguments.
pub fn parse_cli_kv(args: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut i = 0usize;
    while i < args.len() {
        let a = args[i].as_str();
        if a.starts_with("--") {
            let k = a.trim_start_matches("--").to_string();
            if i + 1 < args.len() && !args[i + 1].starts_with("--") {
                out.insert(k, args[i + 1].clone());
                i += 2;
                continue;
            }
            out.insert(k, "true".to_string());
            i += 1;
            continue;
        }
        i += 1;
    }
    out
}

pub fn cli_usage() -> &'static str {
    "Usage:\n  kline-pipeline stat --timeframe <1m|5m|1h|4h> --symbols <BTC-USDT,ETH-USDT,...> [--bars N] [--db PATH] [--json]\n\n\
Examples:\n  kline-pipeline stat --timeframe 1m --symbols BTC-USDT,ETH-USDT --bars 1500\n  KLINE_DB_PATH=./kline.db kline-pipeline stat --timeframe 4h --symbols BTC-USDT\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(conn: &Connection, buckets: &[i64]) {
        for b in buckets {
            conn.execute(
                "INSERT INTO kline_1m (symbol, bucket_start, open, high, low, close, volume)
                 VALUES ('BTC-USDT', ?1, 1.0, 1.0, 1.0, 1.0, 1.0)",
                (b,),
            )
            .unwrap();
        }
    }

    #[test]
    fn counts_gaps_between_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("kline.db");
        {
            let conn = Connection::open(&db).unwrap();
            ensure_schema(&conn).unwrap();
            // Minutes 0, 1, 4, 5: a two-bar hole between 1 and 4.
            seed(
                &conn,
                &[
                    1_700_000_000_000,
                    1_700_000_060_000,
                    1_700_000_240_000,
                    1_700_000_300_000,
                ],
            );
        }

        let st = compute_stat(&db, Timeframe::M1, "btc-usdt", 10).unwrap();
        assert_eq!(st.rows, 4);
        assert_eq!(st.gap_bars, 2);
        assert_eq!(st.max_gap_bars, 2);
        assert!(!st.out_of_order);
        assert_eq!(st.symbol, "BTC-USDT");
    }

    #[test]
    fn empty_table_yields_zero_stat() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("kline.db");
        let st = compute_stat(&db, Timeframe::M1, "BTC-USDT", 10).unwrap();
        assert_eq!(st.rows, 0);
        assert!(st.min_bucket.is_none());
        assert!(st.last_close_age_s.is_none());
    }

    #[test]
    fn parse_cli_kv_handles_flags_and_pairs() {
        let args: Vec<String> = ["--timeframe", "1m", "--json", "--symbols", "BTC-USDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let kv = parse_cli_kv(&args);
        assert_eq!(kv.get("timeframe").map(String::as_str), Some("1m"));
        assert_eq!(kv.get("json").map(String::as_str), Some("true"));
        assert_eq!(kv.get("symbols").map(String::as_str), Some("BTC-USDT"));
    }
}
