//! Shared scaffolding for the hosted test suite
//!
//! The kernel is a web of singletons (frame pool, thread hash,
//! scheduler lists, the clock), so tests that touch them run one at a
//! time behind a global lock and start from a rebuilt world. The
//! `boot()` helper reproduces the interesting part of kernel_main: a
//! first process with a user stack and one running thread.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard, Once};

use crate::arch::{SEGSEL_USER_CS, SEGSEL_USER_DS, USER_EFLAGS};
use crate::kern::context::{frame as tf, set_trap_word};
use crate::kern::process::{self, Process};
use crate::kern::thread::{self, Thread};
use crate::types::VAddr;
use crate::{drivers, loader, lock, ramdisk, vm};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Frames in the test machine's pool.
pub const TEST_FRAMES: usize = 64;

/// Exclusive access to a freshly reset kernel.
pub struct TestEnv {
    _guard: MutexGuard<'static, ()>,
}

/// Serialize on the kernel singletons and wipe them.
pub fn kernel_test_env() -> TestEnv {
    let guard = TEST_LOCK.lock();

    crate::arch::sim_reset();
    vm::usermem::sim_clear_frames();
    vm::frame::reset(TEST_FRAMES);
    thread::reset_for_tests();
    process::reset_for_tests();
    drivers::timer::reset_for_tests();
    lock::mutex::set_operational(false);

    TestEnv { _guard: guard }
}

impl TestEnv {
    /// Bring up the minimal booted world: the first process with its
    /// user stack page, one thread, dispatched.
    pub fn boot(&self) -> (Arc<Process>, Arc<Thread>) {
        thread::init();
        let god = process::create_god_process().expect("god process");
        let t = thread::create_thread(&god).expect("god thread");
        thread::set_running(&t).expect("dispatch god");
        (god, t)
    }
}

// ============================================================================
// Trap Frame Forging
// ============================================================================

/// Write a plausible syscall-wrapper trap frame onto a thread's kernel
/// stack, as if it had just trapped from user mode.
pub fn write_syscall_frame(t: &Arc<Thread>, eip: VAddr, esp: VAddr) {
    let esp0 = t.esp0();
    // SAFETY: the stack is a live allocation owned by the thread.
    unsafe {
        set_trap_word(esp0, tf::SS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::ESP, esp);
        set_trap_word(esp0, tf::EFLAGS, USER_EFLAGS);
        set_trap_word(esp0, tf::CS, u32::from(SEGSEL_USER_CS));
        set_trap_word(esp0, tf::EIP, eip);
        set_trap_word(esp0, tf::SYS_DS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::SYS_ES, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::SYS_FS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::SYS_GS, u32::from(SEGSEL_USER_DS));
        for idx in tf::SYS_EBP..=tf::SYS_ESI {
            set_trap_word(esp0, idx, 0);
        }
    }
}

/// Write a plausible exception-wrapper trap frame.
pub fn write_exception_frame(t: &Arc<Thread>, eip: VAddr, esp: VAddr, error: u32) {
    let esp0 = t.esp0();
    // SAFETY: the stack is a live allocation owned by the thread.
    unsafe {
        set_trap_word(esp0, tf::SS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::ESP, esp);
        set_trap_word(esp0, tf::EFLAGS, USER_EFLAGS);
        set_trap_word(esp0, tf::CS, u32::from(SEGSEL_USER_CS));
        set_trap_word(esp0, tf::EIP, eip);
        set_trap_word(esp0, tf::EXC_ERROR, error);
        set_trap_word(esp0, tf::EXC_DS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::EXC_ES, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::EXC_FS, u32::from(SEGSEL_USER_DS));
        set_trap_word(esp0, tf::EXC_GS, u32::from(SEGSEL_USER_DS));
        for idx in tf::EXC_EAX..=tf::EXC_EDI {
            set_trap_word(esp0, idx, 0);
        }
    }
}

// ============================================================================
// Test Program Images
// ============================================================================

/// Entry point of every synthetic test program.
pub const TEST_ENTRY: VAddr = 0x0100_0020;
/// Text load address.
pub const TEST_TXT_START: VAddr = 0x0100_0000;
/// Data load address.
pub const TEST_DAT_START: VAddr = 0x0100_2000;
/// Bss load address.
pub const TEST_BSS_START: VAddr = 0x0100_3000;

static TEST_TOC: Once<Vec<ramdisk::Entry>> = Once::new();

/// Install a RAM disk holding synthetic `hello`, `idle` and `init`
/// executables.
pub fn install_test_programs() {
    let toc = TEST_TOC.call_once(|| {
        let mut entries = Vec::new();
        for name in ["hello", "idle", "init", "god", "shell"] {
            let image = loader::build_test_image(
                TEST_ENTRY,
                TEST_TXT_START,
                b"\x90\x90\x90\xc3",
                TEST_DAT_START,
                b"DATA",
                TEST_BSS_START,
                0x100,
            );
            entries.push(ramdisk::Entry {
                name: String::from(name).leak(),
                bytes: image.leak(),
            });
        }
        entries
    });
    ramdisk::install_for_tests(toc.as_slice());
}
