//! Condition variables
//!
//! A condvar is a FIFO of suspended threads protected by its own
//! internal mutex. `wait` enqueues the caller, drops the user's mutex
//! and deschedules; `signal` pops the head and makes it runnable,
//! yielding to the target if it has not finished descheduling yet (that
//! closes the window between enqueue and deschedule).

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

use crate::kern::thread;
use crate::lock::mutex::KMutex;
use crate::syscall::management::{deschedule_self, make_runnable_tid, yield_to};
use crate::types::Tid;

#[cfg(test)]
use core::sync::atomic::{AtomicU32, Ordering};

struct CondInner {
    /// Protects the waiter queue.
    mutex: KMutex,
    /// Threads waiting to be signaled, FIFO. Only touched under `mutex`.
    waiters: Mutex<VecDeque<Tid>>,
    #[cfg(test)]
    signals: AtomicU32,
    #[cfg(test)]
    broadcasts: AtomicU32,
}

/// A condition variable handle. Clones share the same condvar.
#[derive(Clone)]
pub struct KCondvar {
    inner: Arc<CondInner>,
}

impl KCondvar {
    pub fn new() -> KCondvar {
        KCondvar {
            inner: Arc::new(CondInner {
                mutex: KMutex::new(),
                waiters: Mutex::new(VecDeque::new()),
                #[cfg(test)]
                signals: AtomicU32::new(0),
                #[cfg(test)]
                broadcasts: AtomicU32::new(0),
            }),
        }
    }

    /// Wait for a signal. `user_mutex` is released while waiting and
    /// reacquired before returning.
    pub fn wait(&self, user_mutex: &KMutex) {
        self.inner.mutex.lock();
        self.inner
            .waiters
            .lock()
            .push_back(thread::get_self().tid());
        self.inner.mutex.unlock();

        user_mutex.unlock();
        deschedule_self();
        user_mutex.lock();
    }

    /// Wake the first waiter, if any; a signal with nobody waiting is
    /// lost.
    pub fn signal(&self) {
        #[cfg(test)]
        self.inner.signals.fetch_add(1, Ordering::Relaxed);
        self.inner.mutex.lock();
        self.awaken_first();
        self.inner.mutex.unlock();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        #[cfg(test)]
        self.inner.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.inner.mutex.lock();
        while self.awaken_first() {}
        self.inner.mutex.unlock();
    }

    /// Pop and wake the head waiter. Yields to a target that has been
    /// enqueued but has not descheduled yet, until it does.
    fn awaken_first(&self) -> bool {
        let target = self.inner.waiters.lock().pop_front();
        match target {
            None => false,
            Some(tid) => {
                while make_runnable_tid(tid).is_err() {
                    let _ = yield_to(tid.0 as i32);
                }
                true
            }
        }
    }

    /// Destroy the condvar. Waiters present is a kernel bug.
    pub fn destroy(&self) {
        self.inner.waiters.lock().clear();
        self.inner.mutex.destroy();
    }

    /// Number of queued waiters (diagnostics and tests).
    pub fn waiter_count(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// Signals delivered so far (tests only).
    #[cfg(test)]
    pub fn signal_count(&self) -> u32 {
        self.inner.signals.load(Ordering::Relaxed)
    }

    /// Broadcasts delivered so far (tests only).
    #[cfg(test)]
    pub fn broadcast_count(&self) -> u32 {
        self.inner.broadcasts.load(Ordering::Relaxed)
    }
}

impl Default for KCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    #[test]
    fn test_signal_without_waiters_is_lost() {
        let env = testutil::kernel_test_env();
        let (_god, _t) = env.boot();
        crate::lock::mutex::install();

        let cv = KCondvar::new();
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn test_waiters_wake_fifo() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();

        // Two forged waiters, blocked as deschedule would leave them.
        let a = thread::create_thread(&god).unwrap();
        let b = thread::create_thread(&god).unwrap();
        thread::set_blocked(&a).unwrap();
        thread::set_blocked(&b).unwrap();

        let cv = KCondvar::new();
        cv.inner.waiters.lock().push_back(a.tid());
        cv.inner.waiters.lock().push_back(b.tid());

        cv.signal();
        // a woke first and b is still parked.
        assert_eq!(a.state(), thread::ThrState::Running);
        assert_eq!(b.state(), thread::ThrState::Blocked);
        assert_eq!(cv.waiter_count(), 1);

        cv.broadcast();
        assert_eq!(b.state(), thread::ThrState::Running);
        assert_eq!(cv.waiter_count(), 0);
    }
}
