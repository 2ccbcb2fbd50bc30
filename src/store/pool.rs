use std::path::Path;

use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::types::Timeframe;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// Open (creating if needed) the candle database behind a bounded connection
/// pool. WAL + NORMAL sync + a busy timeout on every pooled connection.
pub fn open_pool(path: &Path, max_size: u32) -> Result<DbPool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db dir {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=30000;",
        )
    });

    let pool = r2d2::Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .with_context(|| format!("create db pool for {}", path.display()))?;

    {
        let conn = pool.get().context("init schema connection")?;
        ensure_schema(&conn).context("init schema")?;
    }

    Ok(pool)
}

/// One table per timeframe, keyed (symbol, bucket_start). Bucket starts are
/// UTC epoch milliseconds truncated to the timeframe period.
pub fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    for tf in Timeframe::ALL {
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                symbol TEXT NOT NULL,
                bucket_start INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                updated_at TEXT,
                PRIMARY KEY (symbol, bucket_start)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_bucket_start
            ON {table}(bucket_start);
            "#,
            table = tf.table()
        ))?;
    }
    Ok(())
}
