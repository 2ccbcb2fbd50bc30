//! Read-side queries for downstream consumers: "most recent N bars for a
//! symbol", chronologically ordered.

use rusqlite::Connection;

use crate::types::{Bar, Timeframe};

/// Fetch the most recent `limit` bars for a symbol, oldest first.
pub fn recent_bars(
    conn: &Connection,
    timeframe: Timeframe,
    symbol: &str,
    limit: u32,
) -> rusqlite::Result<Vec<Bar>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT symbol, bucket_start, open, high, low, close, volume
         FROM {}
         WHERE symbol = ?1
         ORDER BY bucket_start DESC
         LIMIT ?2",
        timeframe.table()
    ))?;

    let rows: Vec<Bar> = stmt
        .query_map((symbol, limit), |row| {
            Ok(Bar {
                symbol: row.get(0)?,
                timeframe,
                bucket_start_ms: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
                volume: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // The query is newest-first. Reverse to chronological.
    let mut bars = rows;
    bars.reverse();
    Ok(bars)
}

/// Row count and bucket range for one symbol, used by coverage inspection.
pub fn coverage(
    conn: &Connection,
    timeframe: Timeframe,
    symbol: &str,
) -> rusqlite::Result<(i64, Option<i64>, Option<i64>)> {
    conn.query_row(
        &format!(
            "SELECT COUNT(*), MIN(bucket_start), MAX(bucket_start) FROM {} WHERE symbol = ?1",
            timeframe.table()
        ),
        (symbol,),
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
}
