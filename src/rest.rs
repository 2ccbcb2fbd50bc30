//! Outbound REST plumbing for historical candle pages.
//!
//! All requests go through a shared minimum-gap pacer owned by the
//! composition root, so concurrent backfill workers cannot exceed the
//! upstream budget no matter how many run. The fetch result is typed so the
//! retry policy upstream can tell a rate-limit response from a transport
//! fault.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::feed::decode::decode_tick;
use crate::types::{Tick, Timeframe};

/// Upstream rejection code for "too many requests".
const CODE_RATE_LIMITED: &str = "50011";

#[derive(Debug)]
pub enum FetchError {
    /// Upstream asked us to slow down (HTTP 429 or code 50011).
    RateLimited,
    /// Upstream answered with a non-success business code.
    Upstream { code: String, msg: String },
    /// The request never produced a usable response.
    Transport(anyhow::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate limited"),
            Self::Upstream { code, msg } => write!(f, "upstream code {code}: {msg}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Minimum-gap request pacer. `acquire` returns once the caller may start a
/// request; slots are handed out strictly `min_gap` apart across all sharers.
pub struct RateLimiter {
    min_gap: Duration,
    // Earliest instant the next request is allowed to start.
    next_at: tokio::sync::Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            next_at: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        if self.min_gap.is_zero() {
            return;
        }
        let sleep_until = {
            let mut guard = self.next_at.lock().await;
            let now = Instant::now();
            let when = if *guard > now { *guard } else { now };
            *guard = when + self.min_gap;
            when
        };
        let now = Instant::now();
        if sleep_until > now {
            tokio::time::sleep(sleep_until - now).await;
        }
    }
}

/// Source of historical candle pages. The production implementation is
/// [`RestClient`]; tests substitute scripted sources.
pub trait CandleSource: Send + Sync {
    /// Fetch up to `limit` bars strictly older than `after_ms`, newest first.
    fn fetch_older(
        &self,
        inst_id: &str,
        after_ms: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Tick>, FetchError>> + Send;
}

#[derive(Debug, Deserialize)]
struct RestEnvelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

/// Decode one REST envelope body into ticks. Malformed rows are dropped
/// individually, mirroring the feed decoder's fail-closed policy.
fn parse_rest_body(body: &str) -> Result<Vec<Tick>, FetchError> {
    let envelope: RestEnvelope = serde_json::from_str(body)
        .map_err(|e| FetchError::Transport(anyhow::anyhow!("candle page json: {e}")))?;

    match envelope.code.as_str() {
        "0" => {}
        CODE_RATE_LIMITED => return Err(FetchError::RateLimited),
        code => {
            return Err(FetchError::Upstream {
                code: code.to_string(),
                msg: envelope.msg,
            })
        }
    }

    let mut ticks = Vec::with_capacity(envelope.data.len());
    for row in &envelope.data {
        match decode_tick(row) {
            Some(t) => ticks.push(t),
            None => warn!("dropping malformed candle page row: {row:?}"),
        }
    }
    Ok(ticks)
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    bar: &'static str,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl RestClient {
    pub fn new(
        base_url: impl Into<String>,
        timeframe: Timeframe,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("okx-kline-pipeline")
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bar: timeframe.label(),
            limiter,
            timeout: timeout.max(Duration::from_secs(1)),
        })
    }
}

impl CandleSource for RestClient {
    async fn fetch_older(
        &self,
        inst_id: &str,
        after_ms: i64,
        limit: usize,
    ) -> Result<Vec<Tick>, FetchError> {
        self.limiter.acquire().await;

        let url = format!("{}/api/v5/market/candles", self.base_url);
        let after_s = after_ms.to_string();
        let limit_s = limit.to_string();
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("instId", inst_id),
                ("bar", self.bar),
                ("after", after_s.as_str()),
                ("limit", limit_s.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transport(anyhow::anyhow!("candle page request: {e}")))?;

        if resp.status().as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(FetchError::Transport(anyhow::anyhow!(
                "candle page HTTP {}",
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(anyhow::anyhow!("candle page body: {e}")))?;
        parse_rest_body(&body)
    }
}
