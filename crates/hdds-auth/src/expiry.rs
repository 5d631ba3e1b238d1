// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Certificate-expiry dispatcher.
//!
//! Each identity with a finite certificate notAfter gets one scheduled
//! trigger. A background thread sleeps until the earliest deadline and
//! delivers callbacks one at a time, so expiries are totally ordered with
//! respect to each other. Cancellation is O(1): a canceled timer id is
//! simply dropped from the active map and its heap entry becomes a
//! tombstone that the thread skips.
//!
//! The callback is invoked with no dispatcher lock held; the plugin layer
//! guarantees the registry lock is not held either.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::crypto::cert::unix_now;

/// Callback invoked with the identity handle whose certificate expired.
type ExpiryCallback = Box<dyn Fn(u64) + Send + Sync>;

struct DispatcherState {
    /// (deadline unix seconds, timer id), earliest first
    queue: BinaryHeap<Reverse<(i64, u64)>>,
    /// timer id -> identity handle; absence means the timer was canceled
    active: HashMap<u64, u64>,
    next_timer_id: u64,
    enabled: bool,
    stop: bool,
}

struct DispatcherInner {
    state: Mutex<DispatcherState>,
    wakeup: Condvar,
}

/// Handle to the running dispatcher thread; stops and joins it on drop.
pub(crate) struct ExpiryDispatcher {
    inner: Arc<DispatcherInner>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ExpiryDispatcher {
    /// Spawn the dispatcher thread.
    pub fn spawn(on_expire: ExpiryCallback) -> Self {
        let inner = Arc::new(DispatcherInner {
            state: Mutex::new(DispatcherState {
                queue: BinaryHeap::new(),
                active: HashMap::new(),
                next_timer_id: 1,
                enabled: false,
                stop: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_inner = inner.clone();
        let thread = std::thread::Builder::new()
            .name("hdds-auth-expiry".to_string())
            .spawn(move || run_dispatcher(&thread_inner, &on_expire))
            .ok();
        if thread.is_none() {
            log::warn!("[auth-expiry] failed to spawn dispatcher thread");
        }

        Self { inner, thread }
    }

    /// Schedule a trigger for `identity_handle` at `deadline` (unix
    /// seconds). Returns the timer id (never 0).
    pub fn add(&self, identity_handle: u64, deadline: i64) -> u64 {
        let mut state = self.inner.state.lock();
        let timer_id = state.next_timer_id;
        state.next_timer_id += 1;
        state.active.insert(timer_id, identity_handle);
        state.queue.push(Reverse((deadline, timer_id)));
        drop(state);
        self.inner.wakeup.notify_one();
        log::debug!(
            "[auth-expiry] scheduled timer {} for handle {} at {}",
            timer_id,
            identity_handle,
            deadline
        );
        timer_id
    }

    /// Cancel a timer. Safe to call with an already-fired or unknown id.
    pub fn remove(&self, timer_id: u64) {
        if timer_id == 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        state.active.remove(&timer_id);
    }

    /// Enable or disable delivery. While disabled, due timers stay
    /// queued and fire once delivery is enabled again.
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.inner.state.lock();
        state.enabled = enabled;
        drop(state);
        self.inner.wakeup.notify_one();
    }
}

impl Drop for ExpiryDispatcher {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
        }
        self.inner.wakeup.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for ExpiryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExpiryDispatcher")
    }
}

fn run_dispatcher(inner: &DispatcherInner, on_expire: &ExpiryCallback) {
    let mut state = inner.state.lock();
    loop {
        if state.stop {
            return;
        }

        let Some(&Reverse((deadline, timer_id))) = state.queue.peek() else {
            inner.wakeup.wait(&mut state);
            continue;
        };

        let now = unix_now();
        if deadline > now {
            let wait = Duration::from_secs((deadline - now) as u64);
            let _ = inner.wakeup.wait_for(&mut state, wait);
            continue;
        }

        if !state.enabled {
            // hold due events until a listener enables delivery
            inner.wakeup.wait(&mut state);
            continue;
        }

        state.queue.pop();
        let Some(identity_handle) = state.active.remove(&timer_id) else {
            continue; // canceled, tombstone entry
        };

        // deliver without holding the dispatcher lock
        drop(state);
        log::debug!(
            "[auth-expiry] timer {} fired for handle {}",
            timer_id,
            identity_handle
        );
        on_expire(identity_handle);
        state = inner.state.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_due_timer_fires() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ExpiryDispatcher::spawn(Box::new(move |handle| {
            let _ = tx.send(handle);
        }));
        dispatcher.set_enabled(true);
        dispatcher.add(42, unix_now() - 1);

        let fired = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer should fire");
        assert_eq!(fired, 42);
    }

    #[test]
    fn test_canceled_timer_does_not_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();
        let dispatcher = ExpiryDispatcher::spawn(Box::new(move |_| {
            count_cb.fetch_add(1, Ordering::SeqCst);
        }));
        dispatcher.set_enabled(true);

        let timer = dispatcher.add(7, unix_now() + 1);
        dispatcher.remove(timer);

        std::thread::sleep(Duration::from_millis(1500));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disabled_dispatcher_holds_events_until_enabled() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ExpiryDispatcher::spawn(Box::new(move |handle| {
            let _ = tx.send(handle);
        }));
        dispatcher.add(7, unix_now() - 1);

        // nothing is delivered while disabled
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        dispatcher.set_enabled(true);
        let fired = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("held event should fire once enabled");
        assert_eq!(fired, 7);
    }

    #[test]
    fn test_remove_unknown_timer_is_noop() {
        let dispatcher = ExpiryDispatcher::spawn(Box::new(|_| {}));
        dispatcher.remove(0);
        dispatcher.remove(999);
    }
}
