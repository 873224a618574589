//! Rate-limited work queue
//!
//! Keys are deduplicated: a key added several times before a worker picks it
//! up is handed out once. A key added while it is being processed is held
//! back and re-queued when the worker calls [`WorkQueue::done`], so one key is
//! never reconciled by two workers at the same time.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be handed out
    dirty: HashSet<T>,
    /// Keys currently held by a worker
    processing: HashSet<T>,
    /// Per-key failure count and backoff
    failures: HashMap<T, (u32, ExponentialBackoff)>,
    shutting_down: bool,
}

/// Deduplicating work queue with per-key exponential backoff
pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, backoff_initial: Duration, backoff_max: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff_initial,
            backoff_max,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a key unless it is already waiting
    pub fn add(&self, key: T) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            // Registered before the check so an add between the check and the
            // await still wakes us
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as no longer being processed
    pub fn done(&self, key: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
    }

    /// Enqueue a key after a delay
    pub fn add_after(self: &Arc<Self>, key: T, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue a key after its next backoff delay; returns the delay used
    pub fn add_rate_limited(self: &Arc<Self>, key: T) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let (initial, max) = (self.backoff_initial, self.backoff_max);
            let (count, backoff) = state
                .failures
                .entry(key.clone())
                .or_insert_with(|| (0, new_backoff(initial, max)));
            *count += 1;
            backoff.next_backoff().unwrap_or(max)
        };
        self.add_after(key, delay);
        delay
    }

    /// Clear a key's failure history
    pub fn forget(&self, key: &T) {
        self.state.lock().failures.remove(key);
    }

    /// How many times a key has been requeued with backoff
    pub fn num_requeues(&self, key: &T) -> u32 {
        self.state
            .lock()
            .failures
            .get(key)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys; waiting `get` calls return `None`
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

fn new_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_elapsed_time(None)
        .build()
}
