use serde::Serialize;

/// Supported candle timeframes. Each variant owns a storage table and knows
/// its position in the aggregation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    H1,
    H4,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Timeframe::M1, Timeframe::M5, Timeframe::H1, Timeframe::H4];

    pub const fn period_ms(self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 5 * 60_000,
            Timeframe::H1 => 60 * 60_000,
            Timeframe::H4 => 4 * 60 * 60_000,
        }
    }

    pub const fn table(self) -> &'static str {
        match self {
            Timeframe::M1 => "kline_1m",
            Timeframe::M5 => "kline_5m",
            Timeframe::H1 => "kline_1h",
            Timeframe::H4 => "kline_4h",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
        }
    }

    /// Next timeframe up plus the number of consecutive bars that fold into
    /// one bar of it: 5×1m→5m, 12×5m→1h, 4×1h→4h.
    pub const fn next_up(self) -> Option<(Timeframe, usize)> {
        match self {
            Timeframe::M1 => Some((Timeframe::M5, 5)),
            Timeframe::M5 => Some((Timeframe::H1, 12)),
            Timeframe::H1 => Some((Timeframe::H4, 4)),
            Timeframe::H4 => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Timeframe> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1m" => Some(Timeframe::M1),
            "5m" => Some(Timeframe::M5),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            _ => None,
        }
    }

    /// Floor an epoch-millisecond timestamp to this timeframe's bucket start.
    pub fn truncate_ms(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.period_ms())
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A finalized OHLCV candle. Identity is (symbol, timeframe, bucket_start_ms);
/// storage enforces it with a composite primary key per timeframe table.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bucket_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One decoded row of the upstream's positional candle format.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Upstream sends "1" once the bar is closed and final.
    pub confirmed: bool,
}

/// A (channel, instrument) subscription pair, serialized verbatim into the
/// subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Channel {
    pub channel: String,
    #[serde(rename = "instId")]
    pub inst_id: String,
}

impl Channel {
    pub fn new(channel: impl Into<String>, inst_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            inst_id: inst_id.into(),
        }
    }
}

/// How tick volume folds into the in-progress bar. The candle channel pushes
/// cumulative bar snapshots (replace); trade-delta feeds require summing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeMode {
    #[default]
    Snapshot,
    Delta,
}

impl VolumeMode {
    pub fn parse(raw: &str) -> Option<VolumeMode> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Some(VolumeMode::Snapshot),
            "delta" => Some(VolumeMode::Delta),
            _ => None,
        }
    }
}
