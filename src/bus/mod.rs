//! Event batching for agent session telemetry.
//!
//! The bus provides:
//! - Time-windowed batching with size, burst and priority early flush
//! - Fault-isolated fan-out of batches to subscribers
//! - Throughput and health metrics
//!
//! # Architecture
//!
//! Events flow from transport → RawEventBus → EventBatcher → subscribers:
//! - `RawEventBus`: In-memory broadcast channel fed by the transport
//! - `EventBatcher`: Buffers events (100ms/50 events by default) and cuts batches
//! - `registry`: Optional process-wide batcher with explicit reset

mod batcher;
mod event_types;
mod ingest;
mod metrics;
pub mod registry;

pub use batcher::{BatchListener, EventBatcher, Subscription};
pub use event_types::{
    should_flush_immediately, Event, EventBatch, EventType, FlushReason, RawEvent,
};
pub use ingest::{batch_channel, spawn_pump, RawEventBus};
pub use metrics::BatcherMetrics;
