//! Telemetry batching pipeline for monitored agent sessions.
//!
//! Raw hook events go in; validated, sanitized, time-windowed batches come
//! out to subscribers.
//!
//! # Architecture
//!
//! - `processor`: validation, deep redaction, grouping, dedup, micro-batching
//! - `bus`: the windowed `EventBatcher`, its metrics, ingest plumbing and the
//!   optional process-wide registry
//! - `config`: batcher tuning, from serde or `SESSION_TELEMETRY_*` env vars
//!
//! The binary reads newline-delimited JSON events on stdin and writes one
//! JSON batch per line on stdout.

pub mod bus;
pub mod config;
mod error;
pub mod processor;

#[cfg(test)]
mod tests;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub use bus::{
    registry, BatcherMetrics, Event, EventBatch, EventBatcher, EventType, FlushReason, RawEvent,
    Subscription,
};
pub use config::{BatcherConfig, BatcherConfigPatch};
pub use error::{ListenerError, PipelineError};
pub use processor::{EventProcessor, ProcessorMetrics};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct PipeSummary {
    pub lines_read: u64,
    pub malformed_lines: u64,
    pub metrics: BatcherMetrics,
}

/// Stream newline-delimited raw events from `reader` through a batcher and
/// write each delivered batch as one JSON line to `writer`.
///
/// Lines that are not JSON objects are skipped and counted; events that fail
/// validation show up in the batcher's `error_count`. Whatever is still
/// buffered at end of input is flushed before returning.
pub async fn pipe_ndjson<R, W>(
    reader: R,
    mut writer: W,
    config: BatcherConfig,
) -> Result<PipeSummary, PipelineError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let batcher = EventBatcher::new(config)?;
    let (_subscription, mut batches) = bus::batch_channel(&batcher, OUTPUT_CHANNEL_CAPACITY);

    let mut lines = reader.lines();
    let mut lines_read = 0_u64;
    let mut malformed_lines = 0_u64;

    loop {
        tokio::select! {
            biased;
            Some(batch) = batches.recv() => write_batch(&mut writer, &batch).await?,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                lines_read += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RawEvent>(&line) {
                    Ok(raw) => batcher.add_raw(&raw),
                    Err(e) => {
                        malformed_lines += 1;
                        tracing::warn!(line = lines_read, "skipping unparseable event line: {e}");
                    }
                }
            }
        }
    }

    // A timer task may still be delivering; destroy only once it is done.
    batcher.flush_and_settle().await;
    let metrics = batcher.metrics();
    // Dropping the listeners closes the channel once it is drained.
    batcher.destroy();
    while let Some(batch) = batches.recv().await {
        write_batch(&mut writer, &batch).await?;
    }
    writer.flush().await?;

    Ok(PipeSummary {
        lines_read,
        malformed_lines,
        metrics,
    })
}

async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    batch: &EventBatch,
) -> Result<(), PipelineError> {
    let mut line = serde_json::to_vec(batch)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Application entry point
// ---------------------------------------------------------------------------

pub fn run() -> Result<(), PipelineError> {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("session_telemetry=debug,info")),
        )
        .init();

    let config = BatcherConfig::from_env();
    tracing::info!(?config, "session-telemetry started");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(pipe_ndjson(
        tokio::io::BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        config,
    ))?;

    tracing::info!(
        lines = summary.lines_read,
        malformed = summary.malformed_lines,
        processed = summary.metrics.processed_count,
        rejected = summary.metrics.error_count,
        batches = summary.metrics.batches_flushed,
        "input exhausted"
    );
    Ok(())
}
