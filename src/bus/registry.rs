//! Opt-in process-wide batcher.
//!
//! Most code should own an [`EventBatcher`] built with
//! [`EventBatcher::new`]. The registry exists for hook entry points that have
//! no natural place to thread a handle through.

use std::sync::{Mutex, MutexGuard};

use super::batcher::EventBatcher;

static INSTANCE: Mutex<Option<EventBatcher>> = Mutex::new(None);

/// Return the shared batcher, building one with the default config on first
/// use. Every call returns a handle to the same instance until
/// [`reset_instance`].
pub fn get_instance() -> EventBatcher {
    let mut slot = slot();
    slot.get_or_insert_with(|| {
        tracing::debug!("creating process-wide event batcher");
        EventBatcher::default()
    })
    .clone()
}

/// Destroy the shared batcher and clear the slot. Handles obtained earlier
/// keep pointing at the destroyed instance.
pub fn reset_instance() {
    let previous = slot().take();
    if let Some(batcher) = previous {
        batcher.destroy();
    }
}

/// Install `batcher` as the shared instance, destroying any previous one.
pub fn replace_instance(batcher: EventBatcher) {
    let previous = slot().replace(batcher);
    if let Some(previous) = previous {
        previous.destroy();
    }
}

fn slot() -> MutexGuard<'static, Option<EventBatcher>> {
    INSTANCE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
pub(crate) static REGISTRY_TEST_MUTEX: Mutex<()> = Mutex::new(());
