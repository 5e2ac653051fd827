use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DebounceError {
    #[error("debouncer has been shut down")]
    ShutDown,
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct State<K> {
    slots: HashMap<K, Slot>,
    next_generation: u64,
    shut_down: bool,
}

/// Per-key delayed execution.
///
/// Scheduling a key that already has an armed timer replaces it; only the
/// most recently scheduled action for a key can run, and it runs at most once.
/// Once [`Debouncer::shutdown`] has been called every `schedule` fails with
/// [`DebounceError::ShutDown`].
pub struct Debouncer<K> {
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> Default for Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                next_generation: 0,
                shut_down: false,
            })),
        }
    }

    /// Arms `action` to run after `delay`, cancelling any not-yet-fired action
    /// under the same key.
    pub fn schedule<F>(&self, key: K, delay: Duration, action: F) -> Result<(), DebounceError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(DebounceError::ShutDown);
        }

        state.next_generation = state.next_generation.wrapping_add(1);
        let generation = state.next_generation;
        let shared = Arc::clone(&self.state);
        let task_key = key.clone();

        // The task cannot pass its generation check until this lock is
        // released, by which point its slot is in the map.
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut state = shared.lock();
                match state.slots.get(&task_key) {
                    Some(slot) if slot.generation == generation => {
                        state.slots.remove(&task_key);
                    }
                    _ => return,
                }
            }
            action.await;
        });

        if let Some(previous) = state.slots.insert(key, Slot { generation, handle }) {
            previous.handle.abort();
            debug!(generation, "debounced action superseded");
        }
        Ok(())
    }

    /// Withdraws the armed action for `key`. Returns `false` when nothing was
    /// armed, including when the action has already started.
    pub fn cancel<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.state.lock().slots.remove(key) {
            Some(slot) => {
                slot.handle.abort();
                debug!(generation = slot.generation, "debounced action cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of armed, not-yet-fired actions.
    pub fn pending(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Cancels every armed action and refuses further scheduling. Actions that
    /// already started are left to finish. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let mut state = self.state.lock();
        state.shut_down = true;
        let cancelled = state.slots.len();
        for (_, slot) in state.slots.drain() {
            slot.handle.abort();
        }
        if cancelled > 0 {
            debug!(cancelled, "debouncer shut down with armed actions");
        }
        cancelled
    }
}
