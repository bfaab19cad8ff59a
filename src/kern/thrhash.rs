//! Hash table of all living threads
//!
//! Gives O(1) lookup of any thread by tid, which yield and
//! make_runnable depend on. Buckets are indexed by `tid mod N` with N a
//! power of two. Readers and writers are kept apart by a kernel
//! reader/writer lock; the inner cell is only ever touched under it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::kern::thread::Thread;
use crate::lock::rwlock::{KRwLock, RwMode};
use crate::types::Tid;

/// Bucket count; must stay a power of two.
pub const HASH_ENTRIES: usize = 64;

struct ThreadHash {
    lock: KRwLock,
    buckets: Mutex<Vec<Vec<Arc<Thread>>>>,
}

static HASH: Once<ThreadHash> = Once::new();

fn hash() -> &'static ThreadHash {
    HASH.call_once(|| {
        let mut buckets = Vec::with_capacity(HASH_ENTRIES);
        buckets.resize_with(HASH_ENTRIES, Vec::new);
        ThreadHash {
            lock: KRwLock::new(),
            buckets: Mutex::new(buckets),
        }
    })
}

fn entry(tid: Tid) -> usize {
    tid.0 as usize & (HASH_ENTRIES - 1)
}

/// Register a thread.
pub fn add(thread: &Arc<Thread>) {
    let h = hash();
    h.lock.lock(RwMode::Write);
    h.buckets.lock()[entry(thread.tid())].push(Arc::clone(thread));
    h.lock.unlock();
}

/// Unregister a thread.
pub fn remove(thread: &Arc<Thread>) {
    let h = hash();
    h.lock.lock(RwMode::Write);
    let tid = thread.tid();
    h.buckets.lock()[entry(tid)].retain(|t| t.tid() != tid);
    h.lock.unlock();
}

/// Look a thread up by tid.
pub fn find(tid: Tid) -> Option<Arc<Thread>> {
    let h = hash();
    h.lock.lock(RwMode::Read);
    let found = h.buckets.lock()[entry(tid)]
        .iter()
        .find(|t| t.tid() == tid)
        .cloned();
    h.lock.unlock();
    found
}

/// Number of registered threads.
pub fn count() -> usize {
    let h = hash();
    h.lock.lock(RwMode::Read);
    let n: usize = h.buckets.lock().iter().map(Vec::len).sum();
    h.lock.unlock();
    n
}

/// Drop every registration (tests only).
#[cfg(test)]
pub fn reset() {
    let h = hash();
    for bucket in h.buckets.lock().iter_mut() {
        bucket.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    #[test]
    fn test_add_find_remove() {
        let _env = testutil::kernel_test_env();
        let t = Thread::bare_for_tests();
        let tid = t.tid();
        add(&t);
        assert_eq!(find(tid).unwrap().tid(), tid);
        remove(&t);
        assert!(find(tid).is_none());
    }

    #[test]
    fn test_neighbors_coexist() {
        let _env = testutil::kernel_test_env();
        let a = Thread::bare_for_tests();
        let b = Thread::bare_for_tests();
        add(&a);
        add(&b);
        assert!(find(a.tid()).is_some());
        assert!(find(b.tid()).is_some());
        remove(&a);
        assert!(find(a.tid()).is_none());
        assert!(find(b.tid()).is_some());
        remove(&b);
    }
}
