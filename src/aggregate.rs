//! Multi-timeframe roll-up of finalized bars.
//!
//! Windows are aligned to absolute time, not to arrival count: each child bar
//! occupies the slot its bucket start implies inside the parent bucket, and a
//! parent bar is emitted only when every slot of the window is filled. A gap
//! in the input therefore never produces a partial aggregate; the incomplete
//! window is discarded once a newer window opens and the base-table backfill
//! is the repair path.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::types::{Bar, Timeframe};

struct Window {
    parent_bucket_ms: i64,
    slots: Vec<Option<Bar>>,
}

impl Window {
    fn new(parent_bucket_ms: i64, k: usize) -> Self {
        Self {
            parent_bucket_ms,
            slots: vec![None; k],
        }
    }

    fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn complete(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }
}

/// One aggregation stage: folds k consecutive child-timeframe bars into one
/// parent-timeframe bar, per symbol.
pub struct TimeframeAggregator {
    child: Timeframe,
    parent: Timeframe,
    k: usize,
    windows: HashMap<String, Window>,
}

impl TimeframeAggregator {
    /// Returns `None` when `child` has no parent timeframe.
    pub fn new(child: Timeframe) -> Option<Self> {
        let (parent, k) = child.next_up()?;
        Some(Self {
            child,
            parent,
            k,
            windows: HashMap::new(),
        })
    }

    pub fn parent(&self) -> Timeframe {
        self.parent
    }

    pub fn on_bar(&mut self, bar: &Bar) -> Option<Bar> {
        debug_assert_eq!(bar.timeframe, self.child);

        let parent_bucket_ms = self.parent.truncate_ms(bar.bucket_start_ms);
        let idx = ((bar.bucket_start_ms - parent_bucket_ms) / self.child.period_ms()) as usize;

        let window = self
            .windows
            .entry(bar.symbol.clone())
            .or_insert_with(|| Window::new(parent_bucket_ms, self.k));

        if window.parent_bucket_ms != parent_bucket_ms {
            if parent_bucket_ms < window.parent_bucket_ms {
                // Late bar for a window that already moved on; the durable
                // store still has the child bar, so just skip it here.
                debug!(
                    symbol = %bar.symbol,
                    timeframe = %self.parent,
                    "ignoring late bar for closed window"
                );
                return None;
            }
            if window.filled() > 0 {
                warn!(
                    symbol = %bar.symbol,
                    timeframe = %self.parent,
                    bucket_start_ms = window.parent_bucket_ms,
                    filled = window.filled(),
                    expected = self.k,
                    "discarding incomplete aggregation window (input gap)"
                );
            }
            *window = Window::new(parent_bucket_ms, self.k);
        }

        // Duplicate delivery for a slot just overwrites it.
        window.slots[idx] = Some(bar.clone());

        if !window.complete() {
            return None;
        }

        let window = self.windows.remove(&bar.symbol).expect("window present");
        let bars: Vec<Bar> = window.slots.into_iter().map(|s| s.expect("slot filled")).collect();

        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut volume = 0.0;
        for b in &bars {
            high = high.max(b.high);
            low = low.min(b.low);
            volume += b.volume;
        }

        Some(Bar {
            symbol: bar.symbol.clone(),
            timeframe: self.parent,
            bucket_start_ms: window.parent_bucket_ms,
            open: bars[0].open,
            high,
            low,
            close: bars[self.k - 1].close,
            volume,
        })
    }
}

/// The full 1m→5m→1h→4h chain. Each emitted parent bar recurses into the
/// next stage; the caller persists every bar this returns.
pub struct AggregatorChain {
    stages: Vec<TimeframeAggregator>,
}

impl AggregatorChain {
    pub fn new(base: Timeframe) -> Self {
        let mut stages = Vec::new();
        let mut tf = base;
        while let Some(stage) = TimeframeAggregator::new(tf) {
            tf = stage.parent();
            stages.push(stage);
        }
        Self { stages }
    }

    /// Feed one finalized base bar; returns every higher-timeframe bar it
    /// completes, lowest timeframe first.
    pub fn on_base_bar(&mut self, bar: &Bar) -> Vec<Bar> {
        let mut out = Vec::new();
        let mut current = bar.clone();
        for stage in &mut self.stages {
            match stage.on_bar(&current) {
                Some(parent) => {
                    out.push(parent.clone());
                    current = parent;
                }
                None => break,
            }
        }
        out
    }
}
