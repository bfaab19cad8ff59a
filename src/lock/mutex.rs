//! Kernel mutex
//!
//! Mutual exclusion with bounded waiting and progress under preemption.
//!
//! Only one thread at a time may even look at a mutex's bookkeeping;
//! that right is a one-word test-and-set (the interaction bit). A
//! thread that fails the test-and-set yields directly to whoever holds
//! the bit, donating its timeslice instead of burning it.
//!
//! Ownership of the critical section itself is the `owner` field.
//! Contenders queue FIFO and yield to the owner; release hands the
//! mutex to the first waiter that is still runnable and yields to it.
//!
//! Every mutex a thread holds is pushed on its acquired stack so that
//! vanish can release them involuntarily.
//!
//! Until [`install`] is called at the end of boot, all operations are
//! no-ops; the boot path runs single-threaded and lock-free.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::kern::thread::{self, ThrState};
use crate::panic::kernel_panic;
use crate::syscall::management::yield_to;
use crate::types::Tid;

/// Are mutexes live yet? Cleared during boot.
static OPERATIONAL: AtomicBool = AtomicBool::new(false);

/// Declare mutexes operational. Called once a running thread exists.
pub fn install() {
    OPERATIONAL.store(true, Ordering::Release);
}

/// Is the mutex machinery live?
pub fn operational() -> bool {
    OPERATIONAL.load(Ordering::Acquire)
}

/// Reset to the boot state (tests only).
#[cfg(test)]
pub fn set_operational(on: bool) {
    OPERATIONAL.store(on, Ordering::Release);
}

// ============================================================================
// Mutex
// ============================================================================

struct MutexState {
    /// Thread inside the critical section, if any.
    owner: Option<Tid>,
    /// FIFO of threads waiting for ownership.
    waiters: VecDeque<Tid>,
}

struct KMutexInner {
    /// The interaction bit; guards `state`.
    bit: AtomicBool,
    /// Who holds the interaction bit (0 = nobody); read lock-free by
    /// contenders deciding whom to yield to.
    list_owner: AtomicU32,
    state: UnsafeCell<MutexState>,
}

// SAFETY: `state` is only touched while holding `bit`.
unsafe impl Send for KMutexInner {}
unsafe impl Sync for KMutexInner {}

/// A kernel mutex handle. Clones share the same mutex.
#[derive(Clone)]
pub struct KMutex {
    inner: Arc<KMutexInner>,
}

impl KMutex {
    pub fn new() -> KMutex {
        KMutex {
            inner: Arc::new(KMutexInner {
                bit: AtomicBool::new(false),
                list_owner: AtomicU32::new(0),
                state: UnsafeCell::new(MutexState {
                    owner: None,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Two handles to the same mutex?
    pub fn same_as(&self, other: &KMutex) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take the interaction bit, yielding to its current holder between
    /// attempts.
    fn take_bit(&self, me: Tid) {
        while self.inner.bit.swap(true, Ordering::Acquire) {
            let holder = self.inner.list_owner.load(Ordering::Relaxed);
            if holder != 0 {
                let _ = yield_to(holder as i32);
            } else {
                core::hint::spin_loop();
            }
        }
        self.inner.list_owner.store(me.0, Ordering::Relaxed);
    }

    /// Drop the interaction bit.
    fn release_bit(&self) {
        self.inner.list_owner.store(0, Ordering::Relaxed);
        self.inner.bit.store(false, Ordering::Release);
    }

    /// Access the bookkeeping. Caller holds the interaction bit.
    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut MutexState {
        // SAFETY: the interaction bit serializes all access.
        unsafe { &mut *self.inner.state.get() }
    }

    /// Acquire the mutex. Waiters are served FIFO.
    pub fn lock(&self) {
        if !operational() {
            return;
        }
        let me = thread::get_self();
        let my_tid = me.tid();

        self.take_bit(my_tid);

        if self.state().owner.is_none() {
            self.state().owner = Some(my_tid);
        } else {
            let mut waiting = false;
            while self.state().owner != Some(my_tid) {
                if !waiting {
                    self.state().waiters.push_back(my_tid);
                    waiting = true;
                }
                let owner = self.state().owner;

                // Give the bit back and donate our slice to the owner;
                // it is the one who can make progress for us.
                self.release_bit();
                if let Some(owner) = owner {
                    let _ = yield_to(owner.0 as i32);
                }
                self.take_bit(my_tid);
            }
        }

        // Track for involuntary release on vanish.
        {
            let mut acquired = me.acquired.lock();
            if let Some(top) = acquired.last() {
                if top.same_as(self) {
                    kernel_panic("mutex relock");
                }
            }
            acquired.push(self.clone());
        }

        self.release_bit();
    }

    /// Release the mutex, handing it to the first waiter that is still
    /// runnable, and yield to the new owner.
    pub fn unlock(&self) {
        if !operational() {
            return;
        }
        let me = thread::get_self();

        self.take_bit(me.tid());

        // This must be the most recently acquired lock we still hold.
        {
            let mut acquired = me.acquired.lock();
            match acquired.last() {
                Some(top) if top.same_as(self) => {
                    acquired.pop();
                }
                _ => kernel_panic("we lost a mutex somewhere"),
            }
        }

        if self.state().owner.is_none() {
            // Unlocking an unlocked mutex is an application bug; shrug.
            self.release_bit();
            return;
        }

        // Skim the queue past threads that stopped being runnable while
        // they waited (vanished under us).
        let new_owner = loop {
            match self.state().waiters.pop_front() {
                None => break None,
                Some(tid) => {
                    let runnable = thread::get_thread(tid)
                        .is_some_and(|t| t.state() == ThrState::Running);
                    if runnable {
                        break Some(tid);
                    }
                }
            }
        };
        self.state().owner = new_owner;

        self.release_bit();

        if let Some(tid) = new_owner {
            let _ = yield_to(tid.0 as i32);
        }
    }

    /// Destroy the mutex. Precondition: nobody owns it and nobody is
    /// queued on it; destroying a contended mutex is a kernel bug.
    pub fn destroy(&self) {
        if !operational() {
            return;
        }
        let me = thread::get_self();
        self.take_bit(me.tid());
        if self.state().owner.is_some() || !self.state().waiters.is_empty() {
            kernel_panic("destroying a mutex in use");
        }
        self.release_bit();
    }

    /// Current owner (diagnostics and tests).
    pub fn owner(&self) -> Option<Tid> {
        if self.inner.bit.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: racy snapshot for observation only.
        unsafe { (*self.inner.state.get()).owner }
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}
