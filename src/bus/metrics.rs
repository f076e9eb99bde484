use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Floor for the throughput denominator so back-to-back flushes do not
/// report absurd rates.
const MIN_THROUGHPUT_INTERVAL: Duration = Duration::from_millis(1);

/// Point-in-time view of batcher health.
///
/// `current_batch_size` counts events in the active accumulation window;
/// `queue_length` counts events already cut into batches that listeners have
/// not received yet. Their sum is everything buffered but undelivered.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatcherMetrics {
    pub processed_count: u64,
    pub error_count: u64,
    pub queue_length: usize,
    pub current_batch_size: usize,
    /// Running mean of per-flush wall-clock cost, in milliseconds.
    pub average_processing_time: f64,
    /// Events delivered per second over the interval since the previous flush.
    pub throughput: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub batches_flushed: u64,
    pub listener_errors: u64,
}

#[derive(Debug)]
pub(crate) struct MetricsTracker {
    processed_count: u64,
    error_count: u64,
    batches_flushed: u64,
    listener_errors: u64,
    timed_flushes: u64,
    average_processing_ms: f64,
    throughput: f64,
    last_flush_at: Instant,
    last_processed_at: Option<DateTime<Utc>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            processed_count: 0,
            error_count: 0,
            batches_flushed: 0,
            listener_errors: 0,
            timed_flushes: 0,
            average_processing_ms: 0.0,
            throughput: 0.0,
            last_flush_at: Instant::now(),
            last_processed_at: None,
        }
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn record_listener_errors(&mut self, count: u64) {
        self.listener_errors += count;
    }

    /// Account for one flush leaving the buffer, however many batches it was
    /// split into.
    pub fn record_flush(&mut self, delivered: usize, batches: usize, now: Instant) {
        let elapsed = now
            .saturating_duration_since(self.last_flush_at)
            .max(MIN_THROUGHPUT_INTERVAL);
        self.processed_count += delivered as u64;
        self.batches_flushed += batches as u64;
        self.throughput = delivered as f64 / elapsed.as_secs_f64();
        self.last_flush_at = now;
        self.last_processed_at = Some(Utc::now());
    }

    /// Fold one flush's wall-clock cost into the running mean.
    pub fn record_processing_time(&mut self, cost: Duration) {
        self.timed_flushes += 1;
        let sample = cost.as_secs_f64() * 1000.0;
        self.average_processing_ms += (sample - self.average_processing_ms) / self.timed_flushes as f64;
    }

    pub fn snapshot(&self, current_batch_size: usize, queue_length: usize) -> BatcherMetrics {
        BatcherMetrics {
            processed_count: self.processed_count,
            error_count: self.error_count,
            queue_length,
            current_batch_size,
            average_processing_time: self.average_processing_ms,
            throughput: self.throughput,
            last_processed_at: self.last_processed_at,
            batches_flushed: self.batches_flushed,
            listener_errors: self.listener_errors,
        }
    }
}
