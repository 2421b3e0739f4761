//! LoadingScheduler - priority / background queue pair
//!
//! The priority queue always drains first and is never gated. The background queue is
//! split by tier (high, normal, low; FIFO within a tier) and yields nothing while paused.
//! The loading and loaded sets key on handle alone and make every insertion idempotent:
//! a handle that is queued, loading or loaded is never queued a second time.

use crate::types::{FetchKind, Handle, LoadItem, Priority};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SchedulerState {
    priority: VecDeque<LoadItem>,
    /// Indexed by tier: high, normal, low.
    background: [VecDeque<LoadItem>; 3],
    loading: HashSet<Handle>,
    loaded: HashSet<Handle>,
    paused: bool,
}

impl SchedulerState {
    fn is_queued(&self, handle: Handle) -> bool {
        self.priority.iter().any(|i| i.handle == handle)
            || self
                .background
                .iter()
                .any(|q| q.iter().any(|i| i.handle == handle))
    }

    fn is_settled(&self, handle: Handle) -> bool {
        self.loading.contains(&handle) || self.loaded.contains(&handle)
    }

    fn take_from_background(&mut self, handle: Handle) -> Option<LoadItem> {
        for queue in self.background.iter_mut() {
            if let Some(pos) = queue.iter().position(|i| i.handle == handle) {
                return queue.remove(pos);
            }
        }
        None
    }

    fn background_len(&self) -> usize {
        self.background.iter().map(VecDeque::len).sum()
    }
}

fn tier_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Normal => 1,
        Priority::Low => 2,
    }
}

#[derive(Debug, Default)]
pub struct LoadingScheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
}

impl LoadingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put handles at the front of the line.
    ///
    /// Handles already loading or loaded are skipped; a handle waiting in the background
    /// queue is moved rather than duplicated. Returns how many handles were placed.
    pub fn prioritize(&self, handles: &[Handle], kind: FetchKind) -> usize {
        let placed = {
            let mut state = self.lock();
            let mut placed = 0;
            for &handle in handles {
                if state.is_settled(handle) || state.priority.iter().any(|i| i.handle == handle) {
                    continue;
                }
                let item = match state.take_from_background(handle) {
                    Some(mut moved) => {
                        moved.priority = Priority::High;
                        moved.kind = kind;
                        moved
                    }
                    None => LoadItem::new(handle, kind, Priority::High),
                };
                state.priority.push_back(item);
                placed += 1;
            }
            placed
        };
        if placed > 0 {
            self.changed.notify_waiters();
        }
        placed
    }

    /// Append handles to the background queue at `tier`. Returns how many were added.
    pub fn enqueue(&self, handles: &[Handle], kind: FetchKind, tier: Priority) -> usize {
        let added = {
            let mut state = self.lock();
            let mut added = 0;
            for &handle in handles {
                if state.is_settled(handle) || state.is_queued(handle) {
                    continue;
                }
                state.background[tier_index(tier)].push_back(LoadItem::new(handle, kind, tier));
                added += 1;
            }
            added
        };
        if added > 0 {
            self.changed.notify_waiters();
        }
        added
    }

    /// Dequeue the next item and mark it loading.
    pub fn next(&self) -> Option<LoadItem> {
        let mut state = self.lock();
        let item = match state.priority.pop_front() {
            Some(item) => item,
            None if state.paused => return None,
            None => state.background.iter_mut().find_map(VecDeque::pop_front)?,
        };
        state.loading.insert(item.handle);
        tracing::trace!(
            handle = item.handle,
            priority = ?item.priority,
            waited_ms = item.waited().as_millis() as u64,
            "dequeued"
        );
        Some(item)
    }

    /// Dequeue up to `max` items.
    pub fn next_batch(&self, max: usize) -> Vec<LoadItem> {
        std::iter::from_fn(|| self.next()).take(max).collect()
    }

    /// Terminal: later `enqueue` / `prioritize` calls for the handle are no-ops.
    pub fn mark_loaded(&self, handle: Handle) {
        let mut state = self.lock();
        state.loading.remove(&handle);
        state.loaded.insert(handle);
    }

    /// Not terminal: the handle may be queued again.
    pub fn mark_failed(&self, handle: Handle) {
        self.lock().loading.remove(&handle);
    }

    /// Whether `handle` reached the terminal loaded state.
    pub fn is_loaded(&self, handle: Handle) -> bool {
        self.lock().loaded.contains(&handle)
    }

    /// Whether `handle` has been dequeued and not yet settled.
    pub fn is_loading(&self, handle: Handle) -> bool {
        self.lock().loading.contains(&handle)
    }

    /// Queued items in both queues.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.priority.len() + state.background_len()
    }

    /// Items dequeued and not yet marked loaded or failed.
    pub fn in_flight(&self) -> usize {
        self.lock().loading.len()
    }

    /// Whether the background queue is held.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Hold the background queue. The priority queue keeps draining.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Release the background queue and wake anyone waiting for work.
    pub fn resume(&self) {
        self.lock().paused = false;
        self.changed.notify_waiters();
    }

    /// Wake every waiter without changing state, so it can re-check its own conditions.
    pub fn interrupt(&self) {
        self.changed.notify_waiters();
    }

    /// Return once background draining is allowed.
    pub async fn wait_for_resume(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until something changes: new work, resume, or an interrupt.
    ///
    /// Returns immediately if `next` would yield an item right now, or if `keep_waiting`
    /// says the caller has lost interest. `keep_waiting` is evaluated after the wake-up is
    /// armed, so a state change signalled through [`interrupt`](Self::interrupt) is never
    /// missed.
    pub async fn wait_for_work<F>(&self, keep_waiting: F)
    where
        F: Fn() -> bool,
    {
        let notified = self.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !keep_waiting() {
            return;
        }
        {
            let state = self.lock();
            let ready = !state.priority.is_empty() || (!state.paused && state.background_len() > 0);
            if ready {
                return;
            }
        }
        notified.await;
    }

    /// Reset to empty and unpaused.
    pub fn clear(&self) {
        {
            let mut state = self.lock();
            *state = SchedulerState::default();
        }
        self.changed.notify_waiters();
    }
}
