//! Context switching and kernel stack construction
//!
//! A thread's suspended context is a fixed frame on its own kernel
//! stack; its TCB holds the stack pointer where that frame begins.
//! Switching threads is: save registers on my stack, exchange stack
//! pointers through [`stack_switch`], pop the target's registers, and
//! finish on the target side with `set_running` (TSS esp0 + page
//! directory), dropping the do-not-switch veto on the way out.
//!
//! fork and thread_fork handcraft a child stack that looks exactly like
//! a stack parked inside [`context_switch`]: a copy of the parent's trap
//! frame on top, a synthetic register frame underneath whose return
//! address is the child-return label inside the trap wrapper. The first
//! switch to the child therefore "resumes" it straight out of the trap,
//! with a zero return value.
//!
//! ## Trap frame layouts (words below esp0, 1-based)
//!
//! System call wrapper:
//! `1 ss, 2 esp, 3 eflags, 4 cs, 5 eip, 6 ds, 7 es, 8 fs, 9 gs,
//!  10 ebp, 11 ebx, 12 ecx, 13 edx, 14 edi, 15 esi`
//!
//! Exception wrapper (error code pushed by CPU or a stub zero):
//! `1 ss, 2 esp, 3 eflags, 4 cs, 5 eip, 6 error, 7 ds, 8 es, 9 fs,
//!  10 gs, 11 eax, 12 ecx, 13 edx, 14 ebx, 15 (esp), 16 ebp, 17 esi,
//!  18 edi`

use alloc::sync::Arc;

use crate::arch;
use crate::drivers::timer;
use crate::kern::thread::{self, Thread};
use crate::types::VAddr;

// ============================================================================
// Trap Frame Access
// ============================================================================

/// Word indices below esp0 for the two wrapper layouts.
pub mod frame {
    // Shared iret frame
    pub const SS: usize = 1;
    pub const ESP: usize = 2;
    pub const EFLAGS: usize = 3;
    pub const CS: usize = 4;
    pub const EIP: usize = 5;

    // System call wrapper layout
    pub const SYS_DS: usize = 6;
    pub const SYS_ES: usize = 7;
    pub const SYS_FS: usize = 8;
    pub const SYS_GS: usize = 9;
    pub const SYS_EBP: usize = 10;
    pub const SYS_EBX: usize = 11;
    pub const SYS_ECX: usize = 12;
    pub const SYS_EDX: usize = 13;
    pub const SYS_EDI: usize = 14;
    pub const SYS_ESI: usize = 15;
    /// Size of the syscall wrapper frame in words.
    pub const SYS_WORDS: usize = 15;

    // Exception wrapper layout
    pub const EXC_ERROR: usize = 6;
    pub const EXC_DS: usize = 7;
    pub const EXC_ES: usize = 8;
    pub const EXC_FS: usize = 9;
    pub const EXC_GS: usize = 10;
    pub const EXC_EAX: usize = 11;
    pub const EXC_ECX: usize = 12;
    pub const EXC_EDX: usize = 13;
    pub const EXC_EBX: usize = 14;
    pub const EXC_EBP: usize = 16;
    pub const EXC_ESI: usize = 17;
    pub const EXC_EDI: usize = 18;
}

/// Read the trap-frame word `idx` below `esp0`.
///
/// # Safety
/// `esp0` must be the top of a live kernel stack whose trap frame
/// covers `idx`.
pub unsafe fn trap_word(esp0: usize, idx: usize) -> u32 {
    core::ptr::read((esp0 - 4 * idx) as *const u32)
}

/// Overwrite the trap-frame word `idx` below `esp0`.
///
/// # Safety
/// As [`trap_word`]; the altered state is what iret restores.
pub unsafe fn set_trap_word(esp0: usize, idx: usize, value: u32) {
    core::ptr::write((esp0 - 4 * idx) as *mut u32, value);
}

// ============================================================================
// Stack Switch
// ============================================================================

/// The pivot of the context switch: record where `me` parked its
/// context, hand back where `other` parked its own. Kept out of
/// assembly so the TCB layout stays private to Rust.
pub fn stack_switch(me: &Arc<Thread>, other: &Arc<Thread>, esp: usize) -> usize {
    me.set_esp(esp);
    other.esp()
}

// ============================================================================
// Context Switch
// ============================================================================

/// Transfer the CPU to `other`.
///
/// Interrupts are off for the duration; the do-not-switch veto (raised
/// by the caller before it disturbed the runnable queue) is dropped on
/// the target side. Switching to oneself just drops the veto.
#[cfg(all(target_arch = "x86", not(test)))]
pub fn context_switch(me: &Arc<Thread>, other: &Arc<Thread>) {
    if me.tid() == other.tid() {
        timer::you_can_switch_me_out_now();
        return;
    }
    arch::disable_interrupts();
    // SAFETY: both tids name live threads; the asm preserves the frame
    // contract documented above.
    unsafe {
        stubs::switch_asm(me.tid().0, other.tid().0);
    }
}

/// Hosted rendition: the bookkeeping half of the switch. The target
/// becomes current (queue head, esp0, page directory) and the veto
/// drops; no stacks move because no second execution exists.
#[cfg(not(all(target_arch = "x86", not(test))))]
pub fn context_switch(me: &Arc<Thread>, other: &Arc<Thread>) {
    if me.tid() == other.tid() {
        timer::you_can_switch_me_out_now();
        return;
    }
    arch::disable_interrupts();
    if thread::set_running(other).is_err() {
        crate::panic::kernel_panic("context switch to an unschedulable thread");
    }
    timer::you_can_switch_me_out_now();
    arch::enable_interrupts();
}

// ============================================================================
// Child Stack Construction
// ============================================================================

/// Words in the synthetic context frame: the two switch arguments, the
/// child-return address, and the eight-register save block.
const SWITCH_FRAME_WORDS: usize = 11;
/// Full depth of a handcrafted child stack, in words.
const CHILD_FRAME_WORDS: usize = frame::SYS_WORDS + SWITCH_FRAME_WORDS;

/// Handcraft a child kernel stack.
///
/// The parent's trap frame is copied to the top of the child stack, and
/// a synthetic "parked in context_switch" frame is laid underneath: the
/// switch epilogue will read the child's own identity from the frame,
/// run `set_running` for it, and return through the child-return label,
/// which forces the syscall return value to zero and irets to user
/// mode. The computed stack pointer is recorded as the child's `esp`.
pub fn child_stack(child: &Arc<Thread>, parent_esp0: usize) {
    let new_esp0 = child.esp0();

    // SAFETY: both stacks are live KERNEL_STACK_PAGES allocations and
    // the indices stay inside them.
    unsafe {
        // The parent's trap frame, verbatim.
        for idx in 1..=frame::SYS_WORDS {
            set_trap_word(new_esp0, idx, trap_word(parent_esp0, idx));
        }

        // Synthetic switch frame: [other][self][ret][8 regs].
        let base = frame::SYS_WORDS;
        set_trap_word(new_esp0, base + 1, 0); // 'other' argument, dead
        set_trap_word(new_esp0, base + 2, child.tid().0); // 'self' argument
        set_trap_word(new_esp0, base + 3, child_ret_addr()); // resume point
        for reg in 4..=SWITCH_FRAME_WORDS {
            set_trap_word(new_esp0, base + reg, 0);
        }
    }

    child.set_esp(new_esp0 - 4 * CHILD_FRAME_WORDS);
}

#[cfg(all(target_arch = "x86", not(test)))]
fn child_ret_addr() -> u32 {
    stubs::child_ret as usize as u32
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn child_ret_addr() -> u32 {
    0
}

/// Depth of a handcrafted child stack in bytes (tests).
#[cfg(test)]
pub fn child_frame_bytes() -> usize {
    CHILD_FRAME_WORDS * 4
}

// ============================================================================
// Launch to User Mode
// ============================================================================

/// Enter user mode at `eip` with user stack `esp3`. Used for
/// exec-initialized threads and swexn delivery.
pub fn launch(eip: VAddr, esp3: VAddr) {
    arch::launch(eip, esp3);
}

// ============================================================================
// Architecture Stubs
// ============================================================================

/// The assembly half: trap wrappers and the switch epilogue. The frame
/// contract here must match the word indices in [`frame`].
#[cfg(all(target_arch = "x86", not(test)))]
pub mod stubs {
    use core::arch::{asm, naked_asm};

    /// Rust-side helpers the assembly calls by symbol.
    mod helpers {
        use super::super::*;
        use crate::types::Tid;

        /// Exchange stack pointers between two threads, by tid.
        #[no_mangle]
        pub extern "C" fn granite_stack_switch(me: u32, other: u32, esp: u32) -> u32 {
            let me = thread::get_thread(Tid(me)).expect("switching from a dead thread");
            let other = thread::get_thread(Tid(other)).expect("switching to a dead thread");
            stack_switch(&me, &other, esp as usize) as u32
        }

        /// Finish a switch on the target side.
        #[no_mangle]
        pub extern "C" fn granite_set_running(tid: u32) {
            if let Some(t) = thread::get_thread(Tid(tid)) {
                if thread::set_running(&t).is_err() {
                    crate::panic::kernel_panic("context switch target rejected");
                }
            }
            timer::you_can_switch_me_out_now();
        }
    }

    /// Save the caller's registers, pivot stacks, restore the target's
    /// registers and finish as the target. cdecl: (me_tid, other_tid).
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch_asm(me: u32, other: u32) {
        naked_asm!(
            // Park our context: eight registers under [ret][me][other].
            "pusha",
            // granite_stack_switch(me, other, esp)
            "push esp",
            "push dword ptr [esp + 44]", // other
            "push dword ptr [esp + 44]", // me
            "call granite_stack_switch",
            // Pivot to the target's parked context.
            "mov esp, eax",
            "popa",
            // The target's own 'me' argument sits above the return slot.
            "mov eax, [esp + 4]",
            "push eax",
            "call granite_set_running",
            "add esp, 4",
            "sti",
            "ret",
        );
    }

    /// Where a handcrafted child resumes: force the fork return value
    /// to zero and leave through the syscall wrapper's restore path.
    #[unsafe(naked)]
    pub unsafe extern "C" fn child_ret() {
        naked_asm!(
            // Discard the synthetic [me][other] argument slots.
            "add esp, 8",
            // The child's answer to fork/thread_fork.
            "mov eax, 0",
            "jmp granite_syscall_exit",
        );
    }

    /// Common syscall wrapper tail: unwind the frame and iret.
    #[unsafe(naked)]
    #[no_mangle]
    pub unsafe extern "C" fn granite_syscall_exit() {
        naked_asm!(
            "pop esi",
            "pop edi",
            "pop edx",
            "pop ecx",
            "pop ebx",
            "pop ebp",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "iretd",
        );
    }

    /// Generate a syscall trap wrapper: save the frame, load kernel
    /// data segments, call the handler with the user's argument word
    /// (%esi), and leave through the common tail.
    macro_rules! syscall_wrapper {
        ($name:ident, $handler:ident) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name() {
                naked_asm!(
                    "push ds",
                    "push es",
                    "push fs",
                    "push gs",
                    "push ebp",
                    "push ebx",
                    "push ecx",
                    "push edx",
                    "push edi",
                    "push esi",
                    "mov ax, 0x18",
                    "mov ds, ax",
                    "mov es, ax",
                    "mov fs, ax",
                    "mov gs, ax",
                    "push esi",
                    concat!("call ", stringify!($handler)),
                    "add esp, 4",
                    "jmp granite_syscall_exit",
                );
            }
        };
    }

    syscall_wrapper!(gettid_int, granite_sys_gettid);
    syscall_wrapper!(exec_int, granite_sys_exec);
    syscall_wrapper!(fork_int, granite_sys_fork);
    syscall_wrapper!(thread_fork_int, granite_sys_thread_fork);
    syscall_wrapper!(yield_int, granite_sys_yield);
    syscall_wrapper!(deschedule_int, granite_sys_deschedule);
    syscall_wrapper!(make_runnable_int, granite_sys_make_runnable);
    syscall_wrapper!(sleep_int, granite_sys_sleep);
    syscall_wrapper!(get_ticks_int, granite_sys_get_ticks);
    syscall_wrapper!(set_status_int, granite_sys_set_status);
    syscall_wrapper!(wait_int, granite_sys_wait);
    syscall_wrapper!(vanish_int, granite_sys_vanish);
    syscall_wrapper!(new_pages_int, granite_sys_new_pages);
    syscall_wrapper!(remove_pages_int, granite_sys_remove_pages);
    syscall_wrapper!(getchar_int, granite_sys_getchar);
    syscall_wrapper!(readline_int, granite_sys_readline);
    syscall_wrapper!(print_int, granite_sys_print);
    syscall_wrapper!(set_term_color_int, granite_sys_set_term_color);
    syscall_wrapper!(get_cursor_pos_int, granite_sys_get_cursor_pos);
    syscall_wrapper!(set_cursor_pos_int, granite_sys_set_cursor_pos);
    syscall_wrapper!(halt_int, granite_sys_halt);
    syscall_wrapper!(swexn_int, granite_sys_swexn);
    syscall_wrapper!(readfile_int, granite_sys_readfile);

    /// Generate an exception wrapper: save segments and registers, call
    /// the Rust dispatcher with (cause, error_code), restore and iret.
    /// Vectors without a CPU error code push a zero so the exception
    /// frame layout is the same either way.
    macro_rules! exception_wrapper {
        ($name:ident, $cause:expr, push_zero) => {
            exception_wrapper!(@body $name, $cause, "push 0");
        };
        ($name:ident, $cause:expr, has_error) => {
            exception_wrapper!(@body $name, $cause, "nop");
        };
        (@body $name:ident, $cause:expr, $prologue:expr) => {
            #[unsafe(naked)]
            pub unsafe extern "C" fn $name() {
                naked_asm!(
                    $prologue,
                    "push ds",
                    "push es",
                    "push fs",
                    "push gs",
                    "pusha",
                    "mov ax, 0x18",
                    "mov ds, ax",
                    "mov es, ax",
                    "mov fs, ax",
                    "mov gs, ax",
                    "mov eax, [esp + 48]", // error code
                    "push eax",
                    concat!("push ", stringify!($cause)),
                    "call granite_exception_entry",
                    "add esp, 8",
                    "popa",
                    "pop gs",
                    "pop fs",
                    "pop es",
                    "pop ds",
                    "add esp, 4", // error code
                    "iretd",
                );
            }
        };
    }

    exception_wrapper!(divide_handler, 0x00, push_zero);
    exception_wrapper!(debug_handler, 0x01, push_zero);
    exception_wrapper!(breakpoint_handler, 0x03, push_zero);
    exception_wrapper!(overflow_handler, 0x04, push_zero);
    exception_wrapper!(boundcheck_handler, 0x05, push_zero);
    exception_wrapper!(opcode_handler, 0x06, push_zero);
    exception_wrapper!(nofpu_handler, 0x07, push_zero);
    exception_wrapper!(segfault_handler, 0x0b, has_error);
    exception_wrapper!(stackfault_handler, 0x0c, has_error);
    exception_wrapper!(protfault_handler, 0x0d, has_error);
    exception_wrapper!(fpufault_handler, 0x10, push_zero);
    exception_wrapper!(alignfault_handler, 0x11, has_error);
    exception_wrapper!(simdfault_handler, 0x13, push_zero);

    /// Page faults keep their error code and go to the VM handler.
    #[unsafe(naked)]
    pub unsafe extern "C" fn page_fault_stub() {
        naked_asm!(
            "push ds",
            "push es",
            "push fs",
            "push gs",
            "pusha",
            "mov ax, 0x18",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "call granite_page_fault_entry",
            "popa",
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "add esp, 4",
            "iretd",
        );
    }

    /// Timer interrupt: the handler acknowledges and may switch away.
    #[unsafe(naked)]
    pub unsafe extern "C" fn timer_interrupt_stub() {
        naked_asm!(
            "push ds",
            "push es",
            "push fs",
            "push gs",
            "push ebp",
            "push ebx",
            "push ecx",
            "push edx",
            "push edi",
            "push esi",
            "push eax",
            "mov ax, 0x18",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "call granite_timer_entry",
            "pop eax",
            "jmp granite_syscall_exit",
        );
    }

    /// Keyboard interrupt: buffer the scancode and return.
    #[unsafe(naked)]
    pub unsafe extern "C" fn keyboard_interrupt_stub() {
        naked_asm!(
            "push ds",
            "push es",
            "push fs",
            "push gs",
            "push ebp",
            "push ebx",
            "push ecx",
            "push edx",
            "push edi",
            "push esi",
            "push eax",
            "mov ax, 0x18",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "call granite_keyboard_entry",
            "pop eax",
            "jmp granite_syscall_exit",
        );
    }

    /// C-linkage entry points for the interrupt stubs.
    mod entries {
        #[no_mangle]
        extern "C" fn granite_timer_entry() {
            crate::drivers::timer::timer_handler();
        }

        #[no_mangle]
        extern "C" fn granite_keyboard_entry() {
            crate::drivers::keyboard::keyboard_handler();
        }

        #[no_mangle]
        extern "C" fn granite_page_fault_entry() {
            crate::vm::page::page_fault_handler();
        }

        #[no_mangle]
        extern "C" fn granite_exception_entry(cause: u32, error_code: u32) {
            crate::kern::exception::exception_handler(cause, error_code);
        }
    }

    /// Keep the helper symbols alive for the linker.
    pub fn link_anchor() {
        let _ = helpers::granite_stack_switch as usize;
        let _ = helpers::granite_set_running as usize;
        unsafe { asm!("", options(nomem, nostack)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::kern::thread::ThrState;

    #[test]
    fn test_stack_switch_exchanges_pointers() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();
        let other = thread::create_thread(&god).unwrap();
        other.set_esp(0x4000);

        let back = stack_switch(&me, &other, 0x9000);
        assert_eq!(back, 0x4000);
        assert_eq!(me.esp(), 0x9000);
    }

    #[test]
    fn test_switch_to_self_only_drops_veto() {
        let env = testutil::kernel_test_env();
        let (_god, me) = env.boot();
        timer::dont_switch_me_out();
        context_switch(&me, &me);
        assert!(!timer::no_switch());
        assert_eq!(thread::get_self().tid(), me.tid());
    }

    #[test]
    fn test_switch_makes_target_current() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();
        let other = thread::create_thread(&god).unwrap();
        thread::set_runnable(&other).unwrap();

        timer::dont_switch_me_out();
        context_switch(&me, &other);
        assert_eq!(thread::get_self().tid(), other.tid());
        assert_eq!(other.state(), ThrState::Running);
        assert!(!timer::no_switch());
        assert_eq!(crate::arch::sim_state().esp0, other.esp0());
    }

    #[test]
    fn test_child_stack_layout() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        // Forge a parent trap frame.
        testutil::write_syscall_frame(&me, 0x0100_0040, 0x0200_0000);

        let child = thread::create_thread(&god).unwrap();
        child_stack(&child, me.esp0());

        // The trap frame copied verbatim.
        unsafe {
            assert_eq!(
                trap_word(child.esp0(), frame::EIP),
                trap_word(me.esp0(), frame::EIP)
            );
            assert_eq!(
                trap_word(child.esp0(), frame::ESP),
                trap_word(me.esp0(), frame::ESP)
            );
            // The synthetic frame names the child itself.
            assert_eq!(
                trap_word(child.esp0(), frame::SYS_WORDS + 2),
                child.tid().0
            );
        }
        // The recorded esp sits at the bottom of the whole construction.
        assert_eq!(child.esp(), child.esp0() - child_frame_bytes());

        thread::destroy_thread(&child).unwrap();
    }
}
