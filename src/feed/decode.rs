//! Typed decode of upstream WebSocket frames.
//!
//! The feed interleaves protocol event frames (`{"event": ...}`) with data
//! frames carrying positional candle rows. Everything is decoded at this
//! boundary; a frame or row that does not match the expected shape is dropped
//! here so the rest of the pipeline only ever sees well-formed ticks.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::Tick;

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    arg: Option<RawArg>,
    #[serde(default)]
    data: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Deserialize)]
struct RawArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

/// Protocol-level acknowledgement or error frame. Filtered before the
/// handler; error events are surfaced in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event: String,
    pub code: Option<String>,
    pub msg: Option<String>,
}

/// A decoded market-data frame: one channel/instrument pair and its ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub channel: String,
    pub inst_id: String,
    pub ticks: Vec<Tick>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(EventFrame),
    Data(DataFrame),
}

pub fn parse_f64(v: &Value) -> Option<f64> {
    if let Some(f) = v.as_f64() {
        return Some(f);
    }
    if let Some(s) = v.as_str() {
        return s.parse::<f64>().ok();
    }
    None
}

pub fn parse_i64(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    if let Some(u) = v.as_u64() {
        return Some(u as i64);
    }
    if let Some(s) = v.as_str() {
        return s.parse::<i64>().ok();
    }
    None
}

/// Decode one positional candle row.
///
/// Regular candle rows are `[ts, o, h, l, c, vol, ..., confirm]` with the
/// confirm flag last; mark-price rows are `[ts, o, h, l, c, confirm]` and
/// carry no volume. Anything shorter or non-numeric is rejected.
pub fn decode_tick(row: &[Value]) -> Option<Tick> {
    if row.len() < 6 {
        return None;
    }
    let ts_ms = parse_i64(&row[0])?;
    if ts_ms <= 0 {
        return None;
    }
    let open = parse_f64(&row[1])?;
    let high = parse_f64(&row[2])?;
    let low = parse_f64(&row[3])?;
    let close = parse_f64(&row[4])?;

    let (volume, confirm_idx) = if row.len() >= 7 {
        (parse_f64(&row[5])?, row.len() - 1)
    } else {
        (0.0, 5)
    };
    let confirmed = row[confirm_idx].as_str() == Some("1");

    Some(Tick {
        ts_ms,
        open,
        high,
        low,
        close,
        volume,
        confirmed,
    })
}

/// Decode one text frame. Malformed rows inside an otherwise valid data frame
/// are dropped individually with a warning; a frame that is neither an event
/// nor a data frame is an error for the caller to log and skip.
pub fn decode_frame(txt: &str) -> Result<Frame> {
    let raw: RawFrame = serde_json::from_str(txt).context("ws frame json")?;

    if let Some(event) = raw.event {
        return Ok(Frame::Event(EventFrame {
            event,
            code: raw.code,
            msg: raw.msg,
        }));
    }

    let arg = raw.arg.ok_or_else(|| anyhow!("frame missing arg"))?;
    let data = raw.data.ok_or_else(|| anyhow!("frame missing data"))?;

    let mut ticks = Vec::with_capacity(data.len());
    for row in &data {
        match decode_tick(row) {
            Some(t) => ticks.push(t),
            None => {
                warn!(
                    channel = %arg.channel,
                    inst_id = %arg.inst_id,
                    "dropping malformed candle row: {row:?}"
                );
            }
        }
    }

    Ok(Frame::Data(DataFrame {
        channel: arg.channel,
        inst_id: arg.inst_id,
        ticks,
    }))
}
