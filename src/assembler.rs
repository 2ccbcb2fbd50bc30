//! Per-symbol assembly of ticks into finalized base-timeframe bars.
//!
//! Pure in-memory state transition: no I/O, no retries. A bar is finalized
//! either when a tick for a newer bucket arrives (rollover) or when the
//! upstream marks the in-progress bucket confirmed. Unconfirmed ticks still
//! update the running OHLC (latest values are authoritative) but never leave
//! this module on their own, so speculative partial bars are never persisted.

use std::collections::HashMap;

use crate::types::{Bar, Tick, Timeframe, VolumeMode};

#[derive(Debug, Clone)]
struct InProgress {
    bucket_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl InProgress {
    fn start(bucket_ms: i64, tick: &Tick) -> Self {
        Self {
            bucket_ms,
            open: tick.open,
            high: tick.high,
            low: tick.low,
            close: tick.close,
            volume: tick.volume,
        }
    }

    fn into_bar(self, symbol: &str, timeframe: Timeframe) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe,
            bucket_start_ms: self.bucket_ms,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

pub struct BarAssembler {
    timeframe: Timeframe,
    volume_mode: VolumeMode,
    current: HashMap<String, InProgress>,
}

impl BarAssembler {
    pub fn new(timeframe: Timeframe, volume_mode: VolumeMode) -> Self {
        Self {
            timeframe,
            volume_mode,
            current: HashMap::new(),
        }
    }

    /// Fold one tick into the per-symbol state; returns the previous bar when
    /// this tick rolls the bucket over, or the current bar when the tick
    /// confirms it.
    pub fn on_tick(&mut self, symbol: &str, tick: &Tick) -> Option<Bar> {
        let bucket_ms = self.timeframe.truncate_ms(tick.ts_ms);

        let same_bucket = self
            .current
            .get(symbol)
            .is_some_and(|b| b.bucket_ms == bucket_ms);

        if same_bucket {
            let bar = self.current.get_mut(symbol).expect("bar present");
            bar.high = bar.high.max(tick.high);
            bar.low = bar.low.min(tick.low);
            bar.close = tick.close;
            match self.volume_mode {
                VolumeMode::Snapshot => bar.volume = tick.volume,
                VolumeMode::Delta => bar.volume += tick.volume,
            }
            if tick.confirmed {
                let done = self.current.remove(symbol).expect("bar present");
                return Some(done.into_bar(symbol, self.timeframe));
            }
            return None;
        }

        // New bucket (or first tick ever): finalize whatever was in progress
        // and restart from this tick's values.
        let fresh = InProgress::start(bucket_ms, tick);
        let prev = self.current.insert(symbol.to_string(), fresh);
        if prev.is_none() && tick.confirmed {
            // Single-tick bar that arrives already closed.
            let done = self.current.remove(symbol).expect("bar present");
            return Some(done.into_bar(symbol, self.timeframe));
        }
        prev.map(|p| p.into_bar(symbol, self.timeframe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, o: f64, h: f64, l: f64, c: f64, v: f64, confirmed: bool) -> Tick {
        Tick {
            ts_ms,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            confirmed,
        }
    }

    const T0: i64 = 1_700_000_040_000; // minute-aligned

    #[test]
    fn rollover_emits_folded_bar() {
        // Ticks at :00, :20, :45 inside one minute, then :05 of the next.
        let mut asm = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        assert!(asm
            .on_tick("X", &tick(T0, 1.0, 1.0, 1.0, 1.0, 3.0, false))
            .is_none());
        assert!(asm
            .on_tick("X", &tick(T0 + 20_000, 1.0, 1.2, 1.0, 1.2, 5.0, false))
            .is_none());
        assert!(asm
            .on_tick("X", &tick(T0 + 45_000, 1.0, 1.2, 0.9, 0.9, 7.0, false))
            .is_none());

        let bar = asm
            .on_tick("X", &tick(T0 + 65_000, 0.9, 0.95, 0.9, 0.92, 1.0, false))
            .expect("rollover finalizes previous bucket");
        assert_eq!(bar.bucket_start_ms, T0);
        assert_eq!(bar.open, 1.0);
        assert_eq!(bar.high, 1.2);
        assert_eq!(bar.low, 0.9);
        assert_eq!(bar.close, 0.9);
        assert_eq!(bar.volume, 7.0);
    }

    #[test]
    fn confirmed_tick_finalizes_current_bucket() {
        let mut asm = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        assert!(asm
            .on_tick("X", &tick(T0, 1.0, 1.1, 0.9, 1.05, 2.0, false))
            .is_none());
        let bar = asm
            .on_tick("X", &tick(T0 + 59_000, 1.0, 1.3, 0.9, 1.2, 4.0, true))
            .expect("confirm finalizes");
        assert_eq!(bar.high, 1.3);
        assert_eq!(bar.close, 1.2);
        assert_eq!(bar.volume, 4.0);

        // The confirm cleared the slot: the next bucket does not re-emit it.
        assert!(asm
            .on_tick("X", &tick(T0 + 61_000, 1.2, 1.2, 1.2, 1.2, 0.5, false))
            .is_none());
    }

    #[test]
    fn snapshot_volume_replaces_delta_volume_sums() {
        let mut snap = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        snap.on_tick("X", &tick(T0, 1.0, 1.0, 1.0, 1.0, 3.0, false));
        snap.on_tick("X", &tick(T0 + 10_000, 1.0, 1.0, 1.0, 1.0, 5.0, false));
        let bar = snap
            .on_tick("X", &tick(T0 + 60_000, 1.0, 1.0, 1.0, 1.0, 1.0, false))
            .unwrap();
        assert_eq!(bar.volume, 5.0);

        let mut delta = BarAssembler::new(Timeframe::M1, VolumeMode::Delta);
        delta.on_tick("X", &tick(T0, 1.0, 1.0, 1.0, 1.0, 3.0, false));
        delta.on_tick("X", &tick(T0 + 10_000, 1.0, 1.0, 1.0, 1.0, 5.0, false));
        let bar = delta
            .on_tick("X", &tick(T0 + 60_000, 1.0, 1.0, 1.0, 1.0, 1.0, false))
            .unwrap();
        assert_eq!(bar.volume, 8.0);
    }

    #[test]
    fn symbols_are_independent() {
        let mut asm = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        asm.on_tick("AAA", &tick(T0, 1.0, 1.0, 1.0, 1.0, 1.0, false));
        asm.on_tick("BBB", &tick(T0, 2.0, 2.0, 2.0, 2.0, 2.0, false));

        let a = asm
            .on_tick("AAA", &tick(T0 + 60_000, 1.0, 1.0, 1.0, 1.0, 1.0, false))
            .unwrap();
        assert_eq!(a.symbol, "AAA");
        assert_eq!(a.open, 1.0);
        // BBB is still in progress.
        assert!(asm
            .on_tick("BBB", &tick(T0 + 30_000, 2.0, 2.5, 2.0, 2.5, 3.0, false))
            .is_none());
    }

    #[test]
    fn single_confirmed_tick_emits_immediately() {
        let mut asm = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        let bar = asm
            .on_tick("X", &tick(T0, 1.0, 1.1, 0.9, 1.0, 2.0, true))
            .expect("already-closed bar emits without waiting for rollover");
        assert_eq!(bar.bucket_start_ms, T0);
        assert_eq!(bar.volume, 2.0);
    }

    #[test]
    fn high_low_fold_over_all_ticks_in_bucket() {
        let mut asm = BarAssembler::new(Timeframe::M1, VolumeMode::Snapshot);
        let highs = [1.0, 1.4, 1.2, 1.1];
        let lows = [0.8, 0.9, 0.6, 0.95];
        for (i, (&h, &l)) in highs.iter().zip(lows.iter()).enumerate() {
            asm.on_tick(
                "X",
                &tick(T0 + (i as i64) * 5_000, 1.0, h, l, 1.0, 1.0, false),
            );
        }
        let bar = asm
            .on_tick("X", &tick(T0 + 60_000, 1.0, 1.0, 1.0, 1.0, 1.0, false))
            .unwrap();
        assert_eq!(bar.high, 1.4);
        assert_eq!(bar.low, 0.6);
    }
}
