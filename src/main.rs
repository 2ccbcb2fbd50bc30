use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use okx_kline_pipeline::backfill::{run_backfill, BackfillConfig};
use okx_kline_pipeline::config::Config;
use okx_kline_pipeline::feed::FeedManager;
use okx_kline_pipeline::pipeline::PipelineHandler;
use okx_kline_pipeline::rest::{RateLimiter, RestClient};
use okx_kline_pipeline::stat::{cli_usage, compute_stat, parse_cli_kv, print_stat_human, stat_to_json};
use okx_kline_pipeline::store::{open_pool, WriteBuffer, WriteBufferConfig};
use okx_kline_pipeline::types::{Channel, Timeframe};

fn now_ms_i64() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn run_stat_cli(cfg: &Config, argv: &[String]) -> Result<()> {
    let kv = parse_cli_kv(argv);
    if kv.contains_key("help") || kv.contains_key("h") {
        println!("{}", cli_usage());
        return Ok(());
    }

    let timeframe = kv
        .get("timeframe")
        .or_else(|| kv.get("t"))
        .and_then(|s| Timeframe::parse(s))
        .unwrap_or(Timeframe::M1);
    let symbols_raw = kv
        .get("symbols")
        .or_else(|| kv.get("s"))
        .cloned()
        .unwrap_or_default();
    if symbols_raw.trim().is_empty() {
        println!("{}", cli_usage());
        return Ok(());
    }
    let symbols = okx_kline_pipeline::config::parse_symbols_csv(&symbols_raw);
    let bars_wanted: usize = kv
        .get("bars")
        .or_else(|| kv.get("b"))
        .and_then(|s| s.parse().ok())
        .unwrap_or(200);
    let db_path = kv
        .get("db")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| cfg.db_path.clone());
    let want_json = kv.contains_key("json");

    let mut out = Vec::new();
    for sym in &symbols {
        match compute_stat(&db_path, timeframe, sym, bars_wanted) {
            Ok(st) => {
                if want_json {
                    out.push(stat_to_json(&st, bars_wanted));
                } else {
                    print_stat_human(&st, bars_wanted);
                }
            }
            Err(e) => {
                if want_json {
                    out.push(serde_json::json!({"symbol": sym, "error": format!("{e:#}")}));
                } else {
                    println!("{} {} error: {e:#}", sym, timeframe);
                }
            }
        }
    }
    if want_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "db_path": db_path.display().to_string(),
                "items": out,
            }))?
        );
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env();

    // CLI mode: run a single stat command and exit. Service mode runs with
    // no arguments.
    let argv: Vec<String> = env::args().skip(1).collect();
    match argv.first().map(|s| s.as_str()) {
        Some("stat") => return run_stat_cli(&cfg, &argv[1..]),
        Some("help") | Some("--help") | Some("-h") => {
            println!("{}", cli_usage());
            return Ok(());
        }
        _ => {}
    }

    // rustls 0.23+ requires selecting a crypto provider at process start;
    // without this the first TLS handshake panics inside tokio-tungstenite.
    let _ =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    info!(
        ws_url = %cfg.ws_url,
        rest_url = %cfg.rest_url,
        db_path = %cfg.db_path.display(),
        symbols = cfg.symbols.len(),
        channel = %cfg.channel,
        "kline pipeline starting"
    );
    if cfg.symbols.is_empty() {
        anyhow::bail!("KLINE_SYMBOLS resolved to an empty symbol list");
    }

    let base = Timeframe::M1;

    let pool = open_pool(&cfg.db_path, cfg.db_pool_size).context("open candle db")?;
    let (buffer, flush_task) = WriteBuffer::spawn(
        pool.clone(),
        WriteBufferConfig {
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            max_retries: cfg.write_retries,
        },
    );

    // The rate limiter and REST client are constructed once here and shared
    // by every backfill worker.
    let limiter = Arc::new(RateLimiter::new(cfg.rest_min_gap));
    let backfill_task = if cfg.backfill_enable {
        let rest = Arc::new(
            RestClient::new(cfg.rest_url.clone(), base, Arc::clone(&limiter), cfg.rest_timeout)
                .context("build rest client")?,
        );
        let buffer2 = buffer.clone();
        let symbols = cfg.symbols.clone();
        let now = now_ms_i64();
        let since_ms = now - (cfg.backfill_days as i64) * 24 * 60 * 60 * 1000;
        let bf_cfg = BackfillConfig {
            page_limit: cfg.backfill_page_limit,
            max_attempts: cfg.backfill_max_attempts,
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            concurrency: cfg.backfill_concurrency,
        };
        Some(tokio::spawn(async move {
            info!(symbols = symbols.len(), since_ms, "startup backfill begin");
            run_backfill(rest, buffer2, base, symbols, since_ms, now, bf_cfg).await;
            info!("startup backfill finished");
        }))
    } else {
        None
    };

    let channels: Vec<Channel> = cfg
        .symbols
        .iter()
        .map(|s| Channel::new(cfg.channel.clone(), s.clone()))
        .collect();
    let feed = FeedManager::new(
        cfg.ws_url.clone(),
        channels,
        cfg.idle_timeout,
        cfg.reconnect_initial,
        cfg.reconnect_cap,
    );
    let mut handler = PipelineHandler::new(base, cfg.volume_mode, buffer.clone());
    let feed_task = tokio::spawn(async move {
        if let Err(e) = feed.run(&mut handler).await {
            error!("feed loop ended: {e:#}");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("install Ctrl+C handler")?;
    info!("shutdown signal received, draining write buffer");

    // Stop the producers, then let the flush task drain whatever is queued.
    feed_task.abort();
    if let Some(t) = backfill_task {
        t.abort();
    }
    drop(buffer);
    let _ = flush_task.await;

    info!("kline pipeline stopped");
    Ok(())
}
