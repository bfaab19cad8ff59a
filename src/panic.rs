//! Panic policy
//!
//! Two failure severities exist:
//!
//! - [`thread_panic`]: a thread destroyed itself (unhandled fault,
//!   corrupt user state). Its exit status becomes −2 and it vanishes;
//!   the rest of the system keeps running.
//! - [`kernel_panic`]: a kernel invariant broke. Nothing can be trusted
//!   anymore; print and halt.

use crate::arch;

/// Exit status reported for a thread killed by the kernel.
pub const KILLED_STATUS: i32 = -2;

/// Kill the calling thread: status −2, then vanish. Never returns.
pub fn thread_panic(msg: &str) -> ! {
    // The dying thread may have left interrupts off.
    arch::enable_interrupts();
    crate::println!("thread killed: {}", msg);

    crate::syscall::lifecycle::sys_set_status(KILLED_STATUS);
    crate::syscall::lifecycle::sys_vanish();

    // vanish switched away for good on hardware; in the hosted harness
    // there is nobody to switch to, so surface the death to the test.
    #[cfg(test)]
    panic!("thread killed: {msg}");
    #[cfg(not(test))]
    loop {
        arch::halt();
    }
}

/// Stop the kernel: an internal data structure is inconsistent and no
/// thread is safe to run. Never returns.
pub fn kernel_panic(msg: &str) -> ! {
    #[cfg(test)]
    panic!("kernel panic: {msg}");

    #[cfg(not(test))]
    {
        arch::disable_interrupts();
        crate::println!("\n*** KERNEL PANIC: {} ***", msg);
        loop {
            arch::halt();
        }
    }
}
