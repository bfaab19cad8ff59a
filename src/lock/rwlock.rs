//! Reader/writer locks
//!
//! Writer-priority: a writer asking for the lock stops new readers from
//! getting in, and a departing writer hands the lock to the next writer
//! before any reader sees it. Readers can starve while writers keep
//! arriving; that is the stated policy, not an accident.
//!
//! Built from one kernel mutex and two condition variables: writers
//! sleep on `no_threads_in` (everyone out), readers on `no_writers_in`
//! (writers out).

use alloc::sync::Arc;
use spin::Mutex;

use crate::lock::condvar::KCondvar;
use crate::lock::mutex::KMutex;
use crate::panic::kernel_panic;

/// Which side of the lock is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Read,
    Write,
}

#[derive(Default)]
struct RwState {
    writer_in: bool,
    readers_in: u32,
    writers_waiting: u32,
    readers_waiting: u32,
}

struct RwInner {
    mutex: KMutex,
    state: Mutex<RwState>,
    /// Writers wait here until the lock is empty.
    no_threads_in: KCondvar,
    /// Readers wait here until no writer holds or wants the lock.
    no_writers_in: KCondvar,
}

/// A reader/writer lock handle. Clones share the same lock.
#[derive(Clone)]
pub struct KRwLock {
    inner: Arc<RwInner>,
}

impl KRwLock {
    pub fn new() -> KRwLock {
        KRwLock {
            inner: Arc::new(RwInner {
                mutex: KMutex::new(),
                state: Mutex::new(RwState::default()),
                no_threads_in: KCondvar::new(),
                no_writers_in: KCondvar::new(),
            }),
        }
    }

    /// Enter the lock in the requested mode.
    pub fn lock(&self, mode: RwMode) {
        self.inner.mutex.lock();

        match mode {
            RwMode::Read => {
                // Loop: a broadcast can race with the next writer's
                // arrival, so recheck on every wakeup.
                loop {
                    let blocked = {
                        let st = self.inner.state.lock();
                        st.writer_in || st.writers_waiting > 0
                    };
                    if !blocked {
                        break;
                    }
                    self.inner.state.lock().readers_waiting += 1;
                    self.inner.no_writers_in.wait(&self.inner.mutex);
                    self.inner.state.lock().readers_waiting -= 1;
                }
                self.inner.state.lock().readers_in += 1;
            }
            RwMode::Write => {
                let busy = {
                    let st = self.inner.state.lock();
                    st.writer_in || st.readers_in > 0
                };
                if busy {
                    self.inner.state.lock().writers_waiting += 1;
                    self.inner.no_threads_in.wait(&self.inner.mutex);
                    self.inner.state.lock().writers_waiting -= 1;
                }
                self.inner.state.lock().writer_in = true;
            }
        }

        self.inner.mutex.unlock();
    }

    /// Leave the lock. A departing writer hands off to the next writer
    /// if one waits, otherwise lets the reader pool in; the last reader
    /// out wakes the writers.
    pub fn unlock(&self) {
        self.inner.mutex.lock();

        let (was_writer, wake_writers, wake_readers) = {
            let mut st = self.inner.state.lock();
            if st.writer_in {
                if st.writers_waiting > 0 {
                    // Keep writer_in up so no reader sneaks in between
                    // us and the writer we just woke.
                    (true, true, false)
                } else {
                    st.writer_in = false;
                    (true, false, true)
                }
            } else {
                st.readers_in -= 1;
                let wake = st.readers_in == 0 && st.writers_waiting > 0;
                (false, wake, false)
            }
        };
        let _ = was_writer;

        if wake_writers {
            self.inner.no_threads_in.signal();
        }
        if wake_readers {
            self.inner.no_writers_in.broadcast();
        }

        self.inner.mutex.unlock();
    }

    /// Writer-to-reader downgrade: atomically stop being the writer and
    /// join the readers, letting the waiting reader pool in too.
    pub fn downgrade(&self) {
        if !self.inner.state.lock().writer_in {
            kernel_panic("rwlock downgrade without the write lock");
        }

        self.inner.mutex.lock();
        {
            let mut st = self.inner.state.lock();
            st.writer_in = false;
            st.readers_in += 1;
        }
        self.inner.no_writers_in.broadcast();
        self.inner.mutex.unlock();
    }

    /// Destroy the lock. Anyone inside or waiting is a kernel bug.
    pub fn destroy(&self) {
        {
            let st = self.inner.state.lock();
            if st.writer_in || st.readers_in > 0 || st.writers_waiting > 0 || st.readers_waiting > 0
            {
                kernel_panic("destroying an rwlock in use");
            }
        }
        self.inner.mutex.destroy();
        self.inner.no_threads_in.destroy();
        self.inner.no_writers_in.destroy();
    }

    /// (readers_in, writer_in) snapshot for diagnostics and tests.
    pub fn occupancy(&self) -> (u32, bool) {
        let st = self.inner.state.lock();
        (st.readers_in, st.writer_in)
    }
}

impl Default for KRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    fn booted() -> (testutil::TestEnv, KRwLock) {
        let env = testutil::kernel_test_env();
        env.boot();
        crate::lock::mutex::install();
        (env, KRwLock::new())
    }

    #[test]
    fn test_readers_share() {
        let (_env, rw) = booted();
        rw.lock(RwMode::Read);
        rw.lock(RwMode::Read);
        assert_eq!(rw.occupancy(), (2, false));
        rw.unlock();
        rw.unlock();
        assert_eq!(rw.occupancy(), (0, false));
    }

    #[test]
    fn test_writer_excludes() {
        let (_env, rw) = booted();
        rw.lock(RwMode::Write);
        assert_eq!(rw.occupancy(), (0, true));
        rw.unlock();
        assert_eq!(rw.occupancy(), (0, false));
    }

    #[test]
    fn test_writer_handoff_keeps_readers_out() {
        let (_env, rw) = booted();
        rw.lock(RwMode::Write);
        // A writer is queued; a departing writer signals the writers'
        // condition and leaves writer_in up so readers stay out.
        rw.inner.state.lock().writers_waiting = 1;
        rw.unlock();
        assert_eq!(rw.inner.no_threads_in.signal_count(), 1);
        assert_eq!(rw.inner.no_writers_in.broadcast_count(), 0);
        assert_eq!(rw.occupancy(), (0, true));
        // Cleanup: pretend the woken writer came and went.
        rw.inner.state.lock().writers_waiting = 0;
        rw.unlock();
        assert_eq!(rw.occupancy(), (0, false));
    }

    #[test]
    fn test_last_reader_wakes_writers() {
        let (_env, rw) = booted();
        rw.lock(RwMode::Read);
        rw.lock(RwMode::Read);
        rw.inner.state.lock().writers_waiting = 1;

        rw.unlock();
        // Not the last reader; writers stay asleep.
        assert_eq!(rw.inner.no_threads_in.signal_count(), 0);
        rw.unlock();
        assert_eq!(rw.inner.no_threads_in.signal_count(), 1);
        rw.inner.state.lock().writers_waiting = 0;
    }

    #[test]
    fn test_downgrade() {
        let (_env, rw) = booted();
        rw.lock(RwMode::Write);
        rw.downgrade();
        assert_eq!(rw.occupancy(), (1, false));
        assert_eq!(rw.inner.no_writers_in.broadcast_count(), 1);
        rw.unlock();
        assert_eq!(rw.occupancy(), (0, false));
    }
}
