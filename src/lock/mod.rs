//! Kernel synchronization primitives
//!
//! These are the scheduler-aware locks: acquiring one can suspend the
//! calling thread. They are built on a single-word test-and-set plus
//! directed yields, so they stay safe under preemption without any
//! stronger atomic than an exchange.
//!
//! Short, never-sleeping critical sections elsewhere in the kernel use
//! plain spin locks; everything that can wait uses these.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
