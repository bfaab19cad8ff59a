//! Common types used across Granite
//!
//! This module defines shared identifier and address types to avoid
//! circular dependencies between the kernel subsystems.

use core::sync::atomic::{AtomicU32, Ordering};

/// A 32-bit virtual address.
pub type VAddr = u32;

/// A 32-bit physical address.
pub type PAddr = u32;

/// The first thread id ever handed out. Low ids are reserved so the boot
/// path can spot uninitialized descriptors.
pub const INITIAL_TID: u32 = 32;

/// The first process id ever handed out.
pub const INITIAL_PID: u32 = 1;

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl Tid {
    /// Allocate the next thread id. Ids are strictly monotonic and are
    /// never reused.
    pub fn next() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(INITIAL_TID);
        Tid(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// Allocate the next process id. Ids are strictly monotonic and are
    /// never reused.
    pub fn next() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(INITIAL_PID);
        Pid(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_monotonic() {
        let a = Tid::next();
        let b = Tid::next();
        let c = Tid::next();
        assert!(a.0 < b.0);
        assert!(b.0 < c.0);
    }

    #[test]
    fn test_pid_monotonic() {
        let a = Pid::next();
        let b = Pid::next();
        assert!(a.0 < b.0);
    }
}
