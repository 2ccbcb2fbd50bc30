//! Wiring between the feed and the durable store: every decoded candle frame
//! runs through the assembler; each finalized base bar is enqueued for its
//! own table and folded up the timeframe chain, and every completed
//! higher-timeframe bar is enqueued as well.

use anyhow::Result;
use tracing::debug;

use crate::aggregate::AggregatorChain;
use crate::assembler::BarAssembler;
use crate::feed::{DataFrame, FrameHandler};
use crate::store::WriteBuffer;
use crate::types::{Timeframe, VolumeMode};

pub struct PipelineHandler {
    assembler: BarAssembler,
    chain: AggregatorChain,
    buffer: WriteBuffer,
}

impl PipelineHandler {
    pub fn new(base: Timeframe, volume_mode: VolumeMode, buffer: WriteBuffer) -> Self {
        Self {
            assembler: BarAssembler::new(base, volume_mode),
            chain: AggregatorChain::new(base),
            buffer,
        }
    }

    /// Synchronous core, shared by the async handler impl and tests.
    pub fn ingest(&mut self, frame: &DataFrame) {
        if !frame.channel.starts_with("candle") {
            return;
        }
        for tick in &frame.ticks {
            if let Some(bar) = self.assembler.on_tick(&frame.inst_id, tick) {
                debug!(
                    symbol = %bar.symbol,
                    bucket_start_ms = bar.bucket_start_ms,
                    "base bar finalized"
                );
                let rollups = self.chain.on_base_bar(&bar);
                self.buffer.enqueue(bar);
                for rollup in rollups {
                    self.buffer.enqueue(rollup);
                }
            }
        }
    }
}

impl FrameHandler for PipelineHandler {
    async fn on_frame(&mut self, frame: DataFrame) -> Result<()> {
        self.ingest(&frame);
        Ok(())
    }
}
