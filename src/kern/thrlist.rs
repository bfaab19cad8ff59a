//! Thread list discipline
//!
//! The scheduler keeps threads on lists: the runnable queue, the
//! sleeping queue and one waiting list per process. A thread is a
//! member of at most one of them at any time, which is what makes
//! state transitions cheap: remove from wherever you are, insert where
//! you are going.
//!
//! Each list has an identity; a thread records the identity of the list
//! it is on. Insertion refuses a thread that is already somewhere else,
//! so a broken transition shows up at the insert instead of as a
//! corrupted queue.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::errors::{KernError, KernResult};
use crate::kern::thread::Thread;
use crate::types::Pid;

// ============================================================================
// List Identity
// ============================================================================

/// Identifies which list a thread is on. Zero means none.
pub type ListId = u32;

/// Not on any list (blocked, zombie or brand new).
pub const LIST_NONE: ListId = 0;
/// The runnable queue.
pub const LIST_RUNNING: ListId = 1;
/// The sleeping queue.
pub const LIST_SLEEPING: ListId = 2;

/// The waiting list of a process.
pub fn waiting_list_id(pid: Pid) -> ListId {
    0x8000_0000 | pid.0
}

// ============================================================================
// Thread List
// ============================================================================

/// A queue of threads with a fixed identity.
pub struct ThreadList {
    id: ListId,
    queue: VecDeque<Arc<Thread>>,
}

impl ThreadList {
    pub fn new(id: ListId) -> Self {
        ThreadList {
            id,
            queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// The thread at the head, if any.
    pub fn head(&self) -> Option<Arc<Thread>> {
        self.queue.front().cloned()
    }

    fn claim(&self, thread: &Arc<Thread>) -> KernResult<()> {
        if thread.list_id() != LIST_NONE {
            return Err(KernError::ThreadInList);
        }
        thread.set_list_id(self.id);
        Ok(())
    }

    /// Insert at the head.
    pub fn add_head(&mut self, thread: &Arc<Thread>) -> KernResult<()> {
        self.claim(thread)?;
        self.queue.push_front(Arc::clone(thread));
        Ok(())
    }

    /// Insert at the tail.
    pub fn add_tail(&mut self, thread: &Arc<Thread>) -> KernResult<()> {
        self.claim(thread)?;
        self.queue.push_back(Arc::clone(thread));
        Ok(())
    }

    /// Insert keeping the queue sorted by wake time, earliest first.
    /// Ties keep insertion order.
    pub fn add_sorted(&mut self, thread: &Arc<Thread>) -> KernResult<()> {
        self.claim(thread)?;
        let wake = thread.wake();
        let pos = self
            .queue
            .iter()
            .position(|t| t.wake() > wake)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, Arc::clone(thread));
        Ok(())
    }

    /// Remove a thread from this list. `Ok(false)` means the thread was
    /// not on any list to begin with, which is not an error.
    pub fn remove(&mut self, thread: &Arc<Thread>) -> KernResult<bool> {
        let id = thread.list_id();
        if id == LIST_NONE {
            return Ok(false);
        }
        if id != self.id {
            return Err(KernError::RemoveFail);
        }
        match self.queue.iter().position(|t| t.tid() == thread.tid()) {
            Some(pos) => {
                self.queue.remove(pos);
                thread.set_list_id(LIST_NONE);
                Ok(true)
            }
            None => Err(KernError::RemoveFail),
        }
    }

    /// Find by tid without removing.
    pub fn find(&self, tid: crate::types::Tid) -> Option<Arc<Thread>> {
        self.queue.iter().find(|t| t.tid() == tid).cloned()
    }

    /// Drop every member, clearing their membership tags.
    pub fn clear(&mut self) {
        for t in self.queue.drain(..) {
            t.set_list_id(LIST_NONE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::kern::thread::Thread;

    fn mk_thread() -> Arc<Thread> {
        Thread::bare_for_tests()
    }

    #[test]
    fn test_single_membership() {
        let _env = testutil::kernel_test_env();
        let mut a = ThreadList::new(10);
        let mut b = ThreadList::new(11);
        let t = mk_thread();

        a.add_tail(&t).unwrap();
        assert_eq!(t.list_id(), 10);
        // A second list refuses the thread outright.
        assert_eq!(b.add_tail(&t).unwrap_err(), KernError::ThreadInList);
        assert!(a.remove(&t).unwrap());
        assert_eq!(t.list_id(), LIST_NONE);
        b.add_tail(&t).unwrap();
        b.clear();
    }

    #[test]
    fn test_head_tail_order() {
        let _env = testutil::kernel_test_env();
        let mut list = ThreadList::new(10);
        let a = mk_thread();
        let b = mk_thread();
        let c = mk_thread();
        list.add_tail(&a).unwrap();
        list.add_tail(&b).unwrap();
        list.add_head(&c).unwrap();
        assert_eq!(list.head().unwrap().tid(), c.tid());
        assert_eq!(list.size(), 3);
        list.clear();
    }

    #[test]
    fn test_remove_not_in_list_is_ok() {
        let _env = testutil::kernel_test_env();
        let mut list = ThreadList::new(10);
        let t = mk_thread();
        assert!(!list.remove(&t).unwrap());
    }

    #[test]
    fn test_sorted_by_wake() {
        let _env = testutil::kernel_test_env();
        let mut list = ThreadList::new(12);
        let a = mk_thread();
        let b = mk_thread();
        let c = mk_thread();
        a.set_wake(300);
        b.set_wake(100);
        c.set_wake(200);
        list.add_sorted(&a).unwrap();
        list.add_sorted(&b).unwrap();
        list.add_sorted(&c).unwrap();

        let wakes: alloc::vec::Vec<u32> = list.queue.iter().map(|t| t.wake()).collect();
        assert_eq!(wakes, alloc::vec![100, 200, 300]);
        list.clear();
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::kern::testutil;
    use crate::kern::thread::Thread;
    use proptest::prelude::*;

    proptest! {
        /// Sorted insertion keeps the queue ordered by wake tick for
        /// any insertion sequence.
        #[test]
        fn prop_sorted_insert_stays_sorted(wakes in proptest::collection::vec(0u32..1000, 1..20)) {
            let _env = testutil::kernel_test_env();
            let mut list = ThreadList::new(12);
            for w in &wakes {
                let t = Thread::bare_for_tests();
                t.set_wake(*w);
                list.add_sorted(&t).unwrap();
            }
            let got: alloc::vec::Vec<u32> = list.queue.iter().map(|t| t.wake()).collect();
            let mut want = wakes.clone();
            want.sort_unstable();
            prop_assert_eq!(got, want);
            list.clear();
        }
    }
}
