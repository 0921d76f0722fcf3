//! Notification and callback primitives
//!
//! [`Monitor`] is a broadcast wake-up channel, [`IdleCondition`] is the
//! idle-shutdown handshake used by sequences that must drain before
//! closing, and [`CallbackList`] is a copy-on-write callback registry
//! whose dispatch never unwinds into the caller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

/// Broadcast notify channel
///
/// Waiters park on [`Monitor::notified`] and re-check their condition
/// after every wake; `notify_all` wakes all currently parked waiters.
#[derive(Default)]
pub struct Monitor {
    notify: Notify,
}

impl Monitor {
    /// Create a new monitor
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake all currently waiting tasks
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Wait for the next notification
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Default)]
struct IdleState {
    users: usize,
    closed: bool,
}

/// Idle-shutdown handshake
///
/// Users register with [`IdleCondition::update_open`]; the owner calls
/// [`IdleCondition::close`] which succeeds only once no users remain.
#[derive(Default)]
pub struct IdleCondition {
    state: Mutex<IdleState>,
    monitor: Monitor,
}

/// RAII registration against an [`IdleCondition`]
pub struct IdleGuard<'a> {
    condition: &'a IdleCondition,
}

impl IdleCondition {
    /// Create a new idle condition
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; `None` when the condition is already closed
    pub fn update_open(&self) -> Option<IdleGuard<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.users += 1;
        Some(IdleGuard { condition: self })
    }

    /// Attempt to close; succeeds only with zero registered users
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.users == 0 {
            state.closed = true;
        }
        state.closed
    }

    /// Whether the condition has closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait until the last user departs, then close
    pub async fn wait_for_close(&self) {
        loop {
            if self.close() {
                return;
            }
            self.monitor.notified().await;
        }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.condition.state.lock();
        state.users -= 1;
        let idle = state.users == 0;
        drop(state);
        if idle {
            self.condition.monitor.notify_all();
        }
    }
}

/// Handle for removing a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Copy-on-write callback registry
///
/// `add`/`remove` swap the backing vector under a short lock; dispatch
/// iterates a snapshot without holding it. A panicking callback is
/// caught and logged, never unwound into the dispatcher.
pub struct CallbackList<T> {
    inner: Mutex<CallbackListState<T>>,
}

struct CallbackListState<T> {
    callbacks: Arc<Vec<(CallbackId, Callback<T>)>>,
    next_id: u64,
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CallbackListState {
                callbacks: Arc::new(Vec::new()),
                next_id: 0,
            }),
        }
    }
}

impl<T> CallbackList<T> {
    /// Create an empty callback list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback, returning its removal handle
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> CallbackId {
        let mut state = self.inner.lock();
        let id = CallbackId(state.next_id);
        state.next_id += 1;

        let mut next: Vec<_> = state.callbacks.as_ref().clone();
        next.push((id, Arc::new(callback)));
        state.callbacks = Arc::new(next);
        id
    }

    /// Remove a callback by handle
    pub fn remove(&self, id: CallbackId) {
        let mut state = self.inner.lock();
        let mut next: Vec<_> = state.callbacks.as_ref().clone();
        next.retain(|(callback_id, _)| *callback_id != id);
        state.callbacks = Arc::new(next);
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Whether no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback with `value`
    pub fn dispatch(&self, value: &T) {
        let snapshot = self.inner.lock().callbacks.clone();
        for (id, callback) in snapshot.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                warn!(callback = id.0, "callback panicked during dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_idle_condition_blocks_close() {
        let condition = IdleCondition::new();

        let guard = condition.update_open().unwrap();
        assert!(!condition.close());

        drop(guard);
        assert!(condition.close());
        assert!(condition.update_open().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_close() {
        let condition = Arc::new(IdleCondition::new());
        let guard_owner = condition.clone();

        let guard = guard_owner.update_open().unwrap();
        let waiter = {
            let condition = condition.clone();
            tokio::spawn(async move { condition.wait_for_close().await })
        };

        tokio::task::yield_now().await;
        drop(guard);
        waiter.await.unwrap();
        assert!(condition.is_closed());
    }

    #[test]
    fn test_callback_list_dispatch_and_remove() {
        let list: CallbackList<u64> = CallbackList::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = hits.clone();
        let a = list.add(move |v| {
            hits_a.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let hits_b = hits.clone();
        let _b = list.add(move |v| {
            hits_b.fetch_add(*v as usize, Ordering::SeqCst);
        });

        list.dispatch(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        list.remove(a);
        list.dispatch(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callback_panic_contained() {
        let list: CallbackList<()> = CallbackList::new();
        let hits = Arc::new(AtomicUsize::new(0));

        list.add(|_| panic!("callback failure"));
        let hits_after = hits.clone();
        list.add(move |_| {
            hits_after.fetch_add(1, Ordering::SeqCst);
        });

        // The panic is caught; later callbacks still run.
        list.dispatch(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
