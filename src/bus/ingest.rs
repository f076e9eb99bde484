use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::batcher::{EventBatcher, Subscription};
use super::event_types::{EventBatch, RawEvent};
use crate::error::ListenerError;

const BUS_CAPACITY: usize = 1024;

/// In-memory broadcast feed of raw events from the transport side.
pub struct RawEventBus {
    tx: broadcast::Sender<RawEvent>,
    published: AtomicU64,
}

impl Default for RawEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RawEventBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    /// Publish a raw event onto the bus.
    pub fn publish(&self, event: RawEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.tx.send(event) {
            tracing::warn!("raw event bus publish failed (no receivers?): {e}");
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Get a new receiver for this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<RawEvent> {
        self.tx.subscribe()
    }
}

/// Spawn a task that feeds every raw event from `rx` into `batcher`.
///
/// When the bus closes, the remainder is flushed and the task exits.
pub fn spawn_pump(
    mut rx: broadcast::Receiver<RawEvent>,
    batcher: EventBatcher,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(raw) => batcher.add_raw(&raw),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event pump lagged, dropped {n} raw events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Bus shut down: flush remainder and exit.
                    batcher.flush();
                    break;
                }
            }
        }
    })
}

/// Expose batches as a bounded channel for async consumers.
///
/// A consumer that falls `capacity` batches behind misses batches; each miss
/// counts as a listener error on the batcher.
pub fn batch_channel(
    batcher: &EventBatcher,
    capacity: usize,
) -> (Subscription, mpsc::Receiver<EventBatch>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let subscription = batcher.subscribe(move |batch| {
        tx.try_send(batch.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ListenerError::new("batch consumer is full"),
            mpsc::error::TrySendError::Closed(_) => ListenerError::new("batch consumer closed"),
        })
    });
    (subscription, rx)
}
