//! System call dispatch
//!
//! Every call has its own trap vector; the user library is compiled
//! against these numbers and they never change. Each vector's wrapper
//! saves the caller's registers in the syscall frame layout, switches
//! to kernel data segments, and hands the single argument word to the
//! handler here; failures come back as negative integers in the return
//! register.

pub mod drivers;
pub mod helper;
pub mod lifecycle;
pub mod management;
pub mod misc;
pub mod paging;

use crate::arch::SEGSEL_KERNEL_CS;
use crate::interrupt::{create_trap_idt_entry, insert_to_idt, TrapGate};

// ============================================================================
// Trap Vectors
// ============================================================================

/// Fixed trap vector numbers, one per call.
pub mod vector {
    pub const FORK: usize = 0x41;
    pub const EXEC: usize = 0x42;
    pub const WAIT: usize = 0x44;
    pub const YIELD: usize = 0x45;
    pub const DESCHEDULE: usize = 0x46;
    pub const MAKE_RUNNABLE: usize = 0x47;
    pub const GETTID: usize = 0x48;
    pub const NEW_PAGES: usize = 0x49;
    pub const REMOVE_PAGES: usize = 0x4a;
    pub const SLEEP: usize = 0x4b;
    pub const GETCHAR: usize = 0x4c;
    pub const READLINE: usize = 0x4d;
    pub const PRINT: usize = 0x4e;
    pub const SET_TERM_COLOR: usize = 0x4f;
    pub const SET_CURSOR_POS: usize = 0x50;
    pub const GET_CURSOR_POS: usize = 0x51;
    pub const THREAD_FORK: usize = 0x52;
    pub const GET_TICKS: usize = 0x53;
    pub const HALT: usize = 0x55;
    pub const SET_STATUS: usize = 0x59;
    pub const VANISH: usize = 0x60;
    pub const READFILE: usize = 0x62;
    pub const SWEXN: usize = 0x74;
}

// ============================================================================
// Installation
// ============================================================================

/// Wire every system call into the IDT. Traps are reachable from ring 3.
pub fn install_syscalls() {
    drivers::init_syscall_mutexes();

    let mut gate = TrapGate {
        segment: SEGSEL_KERNEL_CS,
        offset: 0,
        privilege_level: 3,
    };

    for &(vec, offset) in wrapper_table().iter() {
        gate.offset = offset;
        insert_to_idt(create_trap_idt_entry(&gate), vec);
    }
}

/// (vector, wrapper entry point) for every call.
#[cfg(all(target_arch = "x86", not(test)))]
fn wrapper_table() -> [(usize, u32); 23] {
    use crate::kern::context::stubs;
    [
        (vector::GETTID, stubs::gettid_int as usize as u32),
        (vector::EXEC, stubs::exec_int as usize as u32),
        (vector::FORK, stubs::fork_int as usize as u32),
        (vector::THREAD_FORK, stubs::thread_fork_int as usize as u32),
        (vector::YIELD, stubs::yield_int as usize as u32),
        (vector::DESCHEDULE, stubs::deschedule_int as usize as u32),
        (vector::MAKE_RUNNABLE, stubs::make_runnable_int as usize as u32),
        (vector::SLEEP, stubs::sleep_int as usize as u32),
        (vector::GET_TICKS, stubs::get_ticks_int as usize as u32),
        (vector::SET_STATUS, stubs::set_status_int as usize as u32),
        (vector::WAIT, stubs::wait_int as usize as u32),
        (vector::VANISH, stubs::vanish_int as usize as u32),
        (vector::NEW_PAGES, stubs::new_pages_int as usize as u32),
        (vector::REMOVE_PAGES, stubs::remove_pages_int as usize as u32),
        (vector::GETCHAR, stubs::getchar_int as usize as u32),
        (vector::READLINE, stubs::readline_int as usize as u32),
        (vector::PRINT, stubs::print_int as usize as u32),
        (vector::SET_TERM_COLOR, stubs::set_term_color_int as usize as u32),
        (vector::GET_CURSOR_POS, stubs::get_cursor_pos_int as usize as u32),
        (vector::SET_CURSOR_POS, stubs::set_cursor_pos_int as usize as u32),
        (vector::HALT, stubs::halt_int as usize as u32),
        (vector::SWEXN, stubs::swexn_int as usize as u32),
        (vector::READFILE, stubs::readfile_int as usize as u32),
    ]
}

/// Hosted builds have no trap wrappers; the gates carry null offsets
/// into the simulated IDT.
#[cfg(not(all(target_arch = "x86", not(test))))]
fn wrapper_table() -> [(usize, u32); 23] {
    [
        (vector::GETTID, 0),
        (vector::EXEC, 0),
        (vector::FORK, 0),
        (vector::THREAD_FORK, 0),
        (vector::YIELD, 0),
        (vector::DESCHEDULE, 0),
        (vector::MAKE_RUNNABLE, 0),
        (vector::SLEEP, 0),
        (vector::GET_TICKS, 0),
        (vector::SET_STATUS, 0),
        (vector::WAIT, 0),
        (vector::VANISH, 0),
        (vector::NEW_PAGES, 0),
        (vector::REMOVE_PAGES, 0),
        (vector::GETCHAR, 0),
        (vector::READLINE, 0),
        (vector::PRINT, 0),
        (vector::SET_TERM_COLOR, 0),
        (vector::GET_CURSOR_POS, 0),
        (vector::SET_CURSOR_POS, 0),
        (vector::HALT, 0),
        (vector::SWEXN, 0),
        (vector::READFILE, 0),
    ]
}

// ============================================================================
// C-linkage Handler Shims
// ============================================================================

/// The symbols the assembly wrappers call. Each receives the user's
/// argument word and returns the value placed in the return register.
#[cfg(all(target_arch = "x86", not(test)))]
mod shims {
    use super::*;

    #[no_mangle]
    extern "C" fn granite_sys_gettid(_arg: u32) -> i32 {
        management::sys_gettid()
    }
    #[no_mangle]
    extern "C" fn granite_sys_exec(arg: u32) -> i32 {
        lifecycle::sys_exec(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_fork(_arg: u32) -> i32 {
        lifecycle::sys_fork()
    }
    #[no_mangle]
    extern "C" fn granite_sys_thread_fork(_arg: u32) -> i32 {
        lifecycle::sys_thread_fork()
    }
    #[no_mangle]
    extern "C" fn granite_sys_yield(arg: u32) -> i32 {
        management::sys_yield(arg as i32)
    }
    #[no_mangle]
    extern "C" fn granite_sys_deschedule(arg: u32) -> i32 {
        management::sys_deschedule(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_make_runnable(arg: u32) -> i32 {
        management::sys_make_runnable(arg as i32)
    }
    #[no_mangle]
    extern "C" fn granite_sys_sleep(arg: u32) -> i32 {
        management::sys_sleep(arg as i32)
    }
    #[no_mangle]
    extern "C" fn granite_sys_get_ticks(_arg: u32) -> i32 {
        management::sys_get_ticks()
    }
    #[no_mangle]
    extern "C" fn granite_sys_set_status(arg: u32) -> i32 {
        lifecycle::sys_set_status(arg as i32);
        0
    }
    #[no_mangle]
    extern "C" fn granite_sys_wait(arg: u32) -> i32 {
        lifecycle::sys_wait(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_vanish(_arg: u32) -> i32 {
        lifecycle::sys_vanish();
        0
    }
    #[no_mangle]
    extern "C" fn granite_sys_new_pages(arg: u32) -> i32 {
        paging::sys_new_pages(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_remove_pages(arg: u32) -> i32 {
        paging::sys_remove_pages(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_getchar(_arg: u32) -> i32 {
        drivers::sys_getchar()
    }
    #[no_mangle]
    extern "C" fn granite_sys_readline(arg: u32) -> i32 {
        drivers::sys_readline(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_print(arg: u32) -> i32 {
        drivers::sys_print(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_set_term_color(arg: u32) -> i32 {
        drivers::sys_set_term_color(arg as i32)
    }
    #[no_mangle]
    extern "C" fn granite_sys_get_cursor_pos(arg: u32) -> i32 {
        drivers::sys_get_cursor_pos(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_set_cursor_pos(arg: u32) -> i32 {
        drivers::sys_set_cursor_pos(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_halt(_arg: u32) -> i32 {
        misc::sys_halt();
        0
    }
    #[no_mangle]
    extern "C" fn granite_sys_swexn(arg: u32) -> i32 {
        management::sys_swexn(arg)
    }
    #[no_mangle]
    extern "C" fn granite_sys_readfile(arg: u32) -> i32 {
        misc::sys_readfile(arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_numbers_are_stable() {
        // The user library is compiled against these.
        assert_eq!(vector::FORK, 0x41);
        assert_eq!(vector::EXEC, 0x42);
        assert_eq!(vector::GETTID, 0x48);
        assert_eq!(vector::VANISH, 0x60);
        assert_eq!(vector::SWEXN, 0x74);
    }

    #[test]
    fn test_wrapper_table_covers_every_vector_once() {
        let table = wrapper_table();
        assert_eq!(table.len(), 23);
        for (i, &(v, _)) in table.iter().enumerate() {
            for &(w, _) in table.iter().skip(i + 1) {
                assert_ne!(v, w, "vector {v:#x} wired twice");
            }
        }
    }
}
