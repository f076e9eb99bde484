use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::event_types::{should_flush_immediately, Event, EventBatch, FlushReason, RawEvent};
use super::metrics::{BatcherMetrics, MetricsTracker};
use crate::config::{BatcherConfig, BatcherConfigPatch};
use crate::error::{ListenerError, PipelineError};
use crate::processor::{EventProcessor, ProcessorMetrics};

/// A batch subscriber. Errors and panics stay inside the listener's own
/// error boundary.
const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub type BatchListener = Arc<dyn Fn(&EventBatch) -> Result<(), ListenerError> + Send + Sync>;

struct PendingBatch {
    batch: EventBatch,
    build_cost: Duration,
}

struct State {
    config: BatcherConfig,
    buffer: Vec<Event>,
    /// Arrival instants inside the trailing burst interval.
    arrivals: VecDeque<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every flush so a stale timer never cuts a newer cycle.
    cycle: u64,
    pending: VecDeque<PendingBatch>,
    in_flight: usize,
    delivering: bool,
    listeners: Vec<(u64, BatchListener)>,
    next_listener_id: u64,
    metrics: MetricsTracker,
    destroyed: bool,
    /// Set once the "no runtime" warning has been logged.
    timer_unavailable_logged: bool,
}

struct Shared {
    state: Mutex<State>,
    processor: EventProcessor,
    runtime: Option<Handle>,
}

/// Accumulates events into time-windowed batches and fans them out to
/// subscribers.
///
/// - A batch is cut when the buffer reaches `max_batch_size`, when arrivals
///   inside `burst_interval_ms` exceed `burst_threshold`, when a priority
///   event type arrives, when the window timer fires, or on `flush()`.
/// - Listeners run outside the internal lock, in subscription order, each in
///   its own error boundary. Batches are delivered FIFO.
///
/// Cloning yields another handle to the same batcher.
#[derive(Clone)]
pub struct EventBatcher {
    shared: Arc<Shared>,
}

/// Handle returned by [`EventBatcher::subscribe`].
///
/// Dropping it keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    shared: Weak<Shared>,
    id: u64,
}

impl Subscription {
    /// Remove exactly this listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = lock(&shared.state);
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != self.id);
        state.listeners.len() != before
    }
}

impl Default for EventBatcher {
    fn default() -> Self {
        Self::build(BatcherConfig::default(), EventProcessor::new())
    }
}

impl EventBatcher {
    /// Create a batcher. Window timers run on the tokio runtime current when
    /// a cycle starts, falling back to the one current at construction.
    pub fn new(config: BatcherConfig) -> Result<Self, PipelineError> {
        Self::with_processor(config, EventProcessor::new())
    }

    pub fn with_processor(
        config: BatcherConfig,
        processor: EventProcessor,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self::build(config, processor))
    }

    fn build(config: BatcherConfig, processor: EventProcessor) -> Self {
        let runtime = Handle::try_current().ok();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: Vec::with_capacity(config.max_batch_size.min(1024)),
                    config,
                    arrivals: VecDeque::new(),
                    timer: None,
                    cycle: 0,
                    pending: VecDeque::new(),
                    in_flight: 0,
                    delivering: false,
                    listeners: Vec::new(),
                    next_listener_id: 0,
                    metrics: MetricsTracker::new(),
                    destroyed: false,
                    timer_unavailable_logged: false,
                }),
                processor,
                runtime,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Buffer one event. Invalid events are dropped and counted; after
    /// `destroy()` this is a no-op.
    pub fn add_event(&self, event: Event) {
        {
            let mut state = lock(&self.shared.state);
            self.accept(&mut state, event);
        }
        self.drain();
    }

    /// Buffer several events, evaluating flush triggers after each one.
    pub fn add_events(&self, events: impl IntoIterator<Item = Event>) {
        let events: Vec<Event> = events.into_iter().collect();
        {
            let mut state = lock(&self.shared.state);
            for event in events {
                if state.destroyed {
                    break;
                }
                self.accept(&mut state, event);
            }
        }
        self.drain();
    }

    /// Validate and sanitize a wire event, then buffer it.
    pub fn add_raw(&self, raw: &RawEvent) {
        self.add_raw_events(std::slice::from_ref(raw));
    }

    pub fn add_raw_events(&self, raws: &[RawEvent]) {
        {
            let mut state = lock(&self.shared.state);
            for raw in raws {
                if state.destroyed {
                    break;
                }
                match self.shared.processor.process(raw) {
                    Some(event) => self.accept(&mut state, event),
                    None => {
                        state.metrics.record_error();
                        tracing::warn!(id = ?raw.id, "dropping malformed raw event");
                    }
                }
            }
        }
        self.drain();
    }

    fn accept(&self, state: &mut State, event: Event) {
        if state.destroyed {
            tracing::trace!(id = %event.id, "ignoring event after destroy");
            return;
        }
        if !event.is_valid() {
            state.metrics.record_error();
            tracing::warn!(id = %event.id, "dropping invalid event");
            return;
        }

        let now = Instant::now();
        let burst_interval = Duration::from_millis(state.config.burst_interval_ms);
        while state
            .arrivals
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > burst_interval)
        {
            state.arrivals.pop_front();
        }
        state.arrivals.push_back(now);

        let priority = should_flush_immediately(&event, &state.config.priority_types);
        state.buffer.push(event);

        let reason = if state.buffer.len() >= state.config.max_batch_size {
            Some(FlushReason::Size)
        } else if state.arrivals.len() > state.config.burst_threshold {
            Some(FlushReason::Burst)
        } else if priority {
            Some(FlushReason::Priority)
        } else {
            None
        };

        match reason {
            Some(reason) => cut(state, reason, now),
            None => self.arm_timer(state),
        }
    }

    fn arm_timer(&self, state: &mut State) {
        if !state.config.flush_on_idle || state.timer.is_some() || state.buffer.is_empty() {
            return;
        }
        let Some(runtime) = Handle::try_current()
            .ok()
            .or_else(|| self.shared.runtime.clone())
        else {
            if !state.timer_unavailable_logged {
                state.timer_unavailable_logged = true;
                tracing::warn!("no tokio runtime available; window flush disabled until one is");
            }
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let cycle = state.cycle;
        let window = Duration::from_millis(state.config.window_ms);
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(window).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            {
                let mut state = lock(&shared.state);
                if state.destroyed || state.cycle != cycle {
                    return;
                }
                // Detach rather than abort: this task owns the handle.
                state.timer = None;
                cut(&mut state, FlushReason::Timeout, Instant::now());
            }
            EventBatcher { shared }.drain();
        }));
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Register a listener. Listeners are invoked in subscription order.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&EventBatch) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let mut state = lock(&self.shared.state);
        let id = state.next_listener_id;
        state.next_listener_id += 1;
        if state.destroyed {
            tracing::trace!("ignoring subscribe after destroy");
        } else {
            state.listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// Deliver whatever is buffered now with reason `manual`.
    pub fn flush(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.destroyed || state.buffer.is_empty() {
                return;
            }
            cut(&mut state, FlushReason::Manual, Instant::now());
        }
        self.drain();
    }

    /// Hand pending batches to listeners until the queue is empty.
    ///
    /// Only one caller delivers at a time; a re-entrant flush from inside a
    /// listener queues its batch and returns, and the active loop picks it up.
    fn drain(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.delivering || state.pending.is_empty() {
                return;
            }
            state.delivering = true;
        }

        loop {
            let (pending, listeners) = {
                let mut state = lock(&self.shared.state);
                match state.pending.pop_front() {
                    Some(pending) => {
                        state.in_flight = pending.batch.len();
                        (pending, state.listeners.clone())
                    }
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };

            let started = Instant::now();
            let failures = deliver(&pending.batch, &listeners);

            let mut state = lock(&self.shared.state);
            state.in_flight = 0;
            state
                .metrics
                .record_processing_time(pending.build_cost + started.elapsed());
            state.metrics.record_listener_errors(failures);
        }
    }

    /// Flush, then wait until every cut batch has reached the listeners,
    /// including batches another task is delivering right now.
    pub async fn flush_and_settle(&self) {
        self.flush();
        loop {
            {
                let state = lock(&self.shared.state);
                if state.pending.is_empty() && state.in_flight == 0 && !state.delivering {
                    return;
                }
            }
            // Pending work with no active deliverer is ours to hand out.
            self.drain();
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Configuration, metrics, lifecycle
    // -----------------------------------------------------------------------

    pub fn config(&self) -> BatcherConfig {
        lock(&self.shared.state).config.clone()
    }

    /// Shallow-merge `patch` into the live config.
    ///
    /// Applies from the next trigger evaluation; a timer already armed keeps
    /// its deadline.
    pub fn update_config(&self, patch: &BatcherConfigPatch) -> Result<BatcherConfig, PipelineError> {
        let mut state = lock(&self.shared.state);
        let merged = state.config.merged(patch)?;
        state.config = merged.clone();
        tracing::debug!(?merged, "event batcher config updated");
        Ok(merged)
    }

    pub fn metrics(&self) -> BatcherMetrics {
        let state = lock(&self.shared.state);
        let queued: usize =
            state.pending.iter().map(|p| p.batch.len()).sum::<usize>() + state.in_flight;
        state.metrics.snapshot(state.buffer.len(), queued)
    }

    /// Counters of the built-in processor used by `add_raw`.
    pub fn processor_metrics(&self) -> ProcessorMetrics {
        self.shared.processor.metrics()
    }

    /// Zero the counters. Buffer, subscriptions and config are untouched.
    pub fn reset(&self) {
        lock(&self.shared.state).metrics = MetricsTracker::new();
        self.shared.processor.reset_metrics();
    }

    /// False once undelivered events exceed `high_water_mark`, or after
    /// `destroy()`.
    pub fn is_healthy(&self) -> bool {
        let state = lock(&self.shared.state);
        if state.destroyed {
            return false;
        }
        let queued: usize =
            state.pending.iter().map(|p| p.batch.len()).sum::<usize>() + state.in_flight;
        state.buffer.len() + queued <= state.config.high_water_mark
    }

    /// Cancel the timer, discard buffered state and subscriptions. Further
    /// input is silently dropped.
    pub fn destroy(&self) {
        let mut state = lock(&self.shared.state);
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        let discarded = state.buffer.len() + state.pending.iter().map(|p| p.batch.len()).sum::<usize>();
        state.buffer.clear();
        state.pending.clear();
        state.arrivals.clear();
        state.listeners.clear();
        state.cycle = state.cycle.wrapping_add(1);
        tracing::debug!(discarded, "event batcher destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        lock(&self.shared.state).destroyed
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.state).listeners.len()
    }

    /// True if both handles point at the same batcher.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Move the buffer into one or more pending batches.
fn cut(state: &mut State, reason: FlushReason, now: Instant) {
    if state.buffer.is_empty() {
        return;
    }
    let started = Instant::now();
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.cycle = state.cycle.wrapping_add(1);
    state.arrivals.clear();

    let mut events = std::mem::take(&mut state.buffer);
    if state.config.preserve_order {
        // `sort_by_key` is stable, so equal timestamps keep arrival order.
        events.sort_by_key(|event| event.timestamp);
    }

    // A shrunken `max_batch_size` can leave more than one batch's worth.
    let max = state.config.max_batch_size.max(1);
    let mut batches = Vec::with_capacity(events.len().div_ceil(max));
    while !events.is_empty() {
        let rest = events.split_off(events.len().min(max));
        batches.push(std::mem::replace(&mut events, rest));
    }

    let count = batches.len() as u32;
    let total: usize = batches.iter().map(Vec::len).sum();
    state.metrics.record_flush(total, batches.len(), now);
    let flushed_at = Utc::now();
    let mut cut_batches = Vec::with_capacity(batches.len());
    for events in batches {
        let batch = EventBatch {
            batch_id: Uuid::new_v4().to_string(),
            events,
            flushed_at,
            reason,
        };
        tracing::debug!(
            batch_id = %batch.batch_id,
            reason = %reason,
            size = batch.len(),
            "event batch cut"
        );
        cut_batches.push(batch);
    }
    let build_cost = started.elapsed() / count.max(1);
    state.pending.extend(
        cut_batches
            .into_iter()
            .map(|batch| PendingBatch { batch, build_cost }),
    );
}

/// Invoke every listener, isolating failures. Returns the failure count.
fn deliver(batch: &EventBatch, listeners: &[(u64, BatchListener)]) -> u64 {
    let mut failures = 0;
    for (id, listener) in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener(batch)))
            .unwrap_or_else(|payload| Err(ListenerError::from_panic(&*payload)));
        if let Err(e) = outcome {
            failures += 1;
            tracing::warn!(
                listener = *id,
                batch_id = %batch.batch_id,
                "batch listener failed: {e}"
            );
        }
    }
    failures
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
