//! Generic delay/size micro-batcher.
//!
//! Independent of [`crate::bus::EventBatcher`]: no validation, ordering or
//! metrics, just "call me with whatever accumulated". Useful for coalescing
//! writes on the consumer side of a batch subscription.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const DEFAULT_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Time since the first buffered item before an automatic flush.
    pub delay: Duration,
    /// Buffer length that triggers a flush inside the call that reached it.
    pub max_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

type Callback<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

struct State<T> {
    buffer: Vec<T>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    callback: Callback<T>,
    options: BatchOptions,
    runtime: Option<Handle>,
}

/// Controller returned by [`batch_events`]. Cloning shares the buffer.
pub struct MicroBatcher<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MicroBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Build a micro-batcher that hands buffered items to `callback`.
///
/// The delay timer runs on the tokio runtime current when a cycle starts,
/// or the one current at construction; without either, only `max_size` and
/// manual flushes fire.
pub fn batch_events<T, F>(callback: F, options: BatchOptions) -> MicroBatcher<T>
where
    T: Send + 'static,
    F: Fn(Vec<T>) + Send + Sync + 'static,
{
    MicroBatcher::new(callback, options)
}

impl<T: Send + 'static> MicroBatcher<T> {
    pub fn new<F>(callback: F, options: BatchOptions) -> Self
    where
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().ok();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: Vec::with_capacity(options.max_size.min(1024)),
                    timer: None,
                    generation: 0,
                }),
                callback: Arc::new(callback),
                options: BatchOptions {
                    max_size: options.max_size.max(1),
                    ..options
                },
                runtime,
            }),
        }
    }

    pub fn add_event(&self, item: T) {
        let ready = {
            let mut state = lock(&self.shared.state);
            state.buffer.push(item);
            if state.buffer.len() >= self.shared.options.max_size {
                Some(take_cycle(&mut state))
            } else {
                if state.timer.is_none() {
                    state.timer = self.schedule(state.generation);
                }
                None
            }
        };
        if let Some(items) = ready {
            (self.shared.callback)(items);
        }
    }

    /// Deliver whatever is buffered now. No-op when empty.
    pub fn flush(&self) {
        let items = {
            let mut state = lock(&self.shared.state);
            if state.buffer.is_empty() {
                return;
            }
            take_cycle(&mut state)
        };
        (self.shared.callback)(items);
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule(&self, generation: u64) -> Option<JoinHandle<()>> {
        let Some(runtime) = Handle::try_current()
            .ok()
            .or_else(|| self.shared.runtime.clone())
        else {
            tracing::debug!("no tokio runtime available; micro-batch delay flush skipped");
            return None;
        };
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let delay = self.shared.options.delay;
        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let items = {
                let mut state = lock(&shared.state);
                if state.generation != generation || state.buffer.is_empty() {
                    return;
                }
                // Detach rather than abort: this is the task holding the handle.
                state.timer = None;
                take_cycle(&mut state)
            };
            (shared.callback)(items);
        }))
    }
}

/// Drain the buffer and start a fresh timing cycle.
fn take_cycle<T>(state: &mut State<T>) -> Vec<T> {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.generation = state.generation.wrapping_add(1);
    std::mem::take(&mut state.buffer)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
