//! # Queue module
//!
//! This module provide a deduplicating, rate limited work queue. An item
//! which is already waiting is never queued twice, and an item which is being
//! processed is only queued again once its worker calls [`WorkQueue::done`],
//! so that a key is never handled by two workers at the same time.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::sleep};
use tracing::trace;

// -----------------------------------------------------------------------------
// Constants

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

// -----------------------------------------------------------------------------
// State structure

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: BTreeSet<T>,
    processing: BTreeSet<T>,
    failures: BTreeMap<T, u32>,
    shutdown: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: BTreeSet::new(),
            processing: BTreeSet::new(),
            failures: BTreeMap::new(),
            shutdown: false,
        }
    }
}

// -----------------------------------------------------------------------------
// WorkQueue structure

#[derive(Debug)]
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<T> WorkQueue<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> WorkQueue<T>
where
    T: Ord + Clone + Debug + Send + Sync + 'static,
{
    /// queue the item, returns false if it was already waiting or the queue
    /// is shut down
    pub fn add(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.shutdown || state.dirty.contains(&item) {
            return false;
        }

        state.dirty.insert(item.to_owned());
        if state.processing.contains(&item) {
            // queued again by `done`
            return true;
        }

        trace!(item = format!("{:?}", item), "Add item to work queue");
        state.queue.push_back(item);
        drop(state);

        self.notify.notify_one();
        true
    }

    /// wait for the next item, returns none once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }

                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.to_owned());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }

                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// mark the item as processed, it is queued again if it has been added
    /// meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);

        if state.dirty.contains(item) && !state.shutdown {
            state.queue.push_back(item.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// queue the item once the delay has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.to_owned();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(item);
        });
    }

    /// queue the item after a per item exponential backoff
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.to_owned()).or_insert(0);
            *failures += 1;
            self.delay(*failures)
        };

        trace!(
            item = format!("{:?}", item),
            delay = delay.as_millis(),
            "Requeue item with backoff"
        );

        self.add_after(item, delay);
    }

    fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures.saturating_sub(1))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// reset the backoff of the item
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// returns the number of items waiting to be processed
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// wake up every worker, subsequent calls to `get` return none
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
