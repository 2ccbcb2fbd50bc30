//! Real-time K-line ingestion and aggregation pipeline.
//!
//! Live path: WebSocket feed → typed decode → per-symbol bar assembly →
//! multi-timeframe roll-up → batched idempotent persistence. Batch path: a
//! rate-limited, concurrency-bounded REST pager fills historical gaps through
//! the same write contract.

pub mod aggregate;
pub mod assembler;
pub mod backfill;
pub mod config;
pub mod feed;
pub mod pipeline;
pub mod rest;
pub mod stat;
pub mod store;
pub mod types;
