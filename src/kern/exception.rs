//! Exception dispatch and swexn delivery
//!
//! Non-page-fault exceptions, and page faults that the VM layer could
//! not repair, all funnel through one policy: a fault from user code
//! goes to the thread's registered swexn handler if it has one; a fault
//! with no handler kills the thread; a fault from kernel mode means the
//! kernel itself is broken and everything stops.
//!
//! Delivery builds a register snapshot (`Ureg`) just below the handler
//! stack, pushes `{fake return, arg, &ureg}`, unregisters the handler
//! (delivery is one-shot) and launches user mode at the handler.

use crate::kern::context::{frame, trap_word};
use crate::kern::{process, thread};
use crate::panic::{kernel_panic, thread_panic};
use crate::vm::usermem;

// ============================================================================
// Causes
// ============================================================================

/// What trapped. Values are the hardware vector numbers, which is also
/// what user space sees in `ureg.cause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Cause {
    Divide = 0x00,
    Debug = 0x01,
    Breakpoint = 0x03,
    Overflow = 0x04,
    BoundCheck = 0x05,
    Opcode = 0x06,
    NoFpu = 0x07,
    SegFault = 0x0b,
    StackFault = 0x0c,
    ProtFault = 0x0d,
    PageFault = 0x0e,
    FpuFault = 0x10,
    AlignFault = 0x11,
    SimdFault = 0x13,
}

impl Cause {
    pub fn from_vector(v: u32) -> Option<Cause> {
        Some(match v {
            0x00 => Cause::Divide,
            0x01 => Cause::Debug,
            0x03 => Cause::Breakpoint,
            0x04 => Cause::Overflow,
            0x05 => Cause::BoundCheck,
            0x06 => Cause::Opcode,
            0x07 => Cause::NoFpu,
            0x0b => Cause::SegFault,
            0x0c => Cause::StackFault,
            0x0d => Cause::ProtFault,
            0x0e => Cause::PageFault,
            0x10 => Cause::FpuFault,
            0x11 => Cause::AlignFault,
            0x13 => Cause::SimdFault,
            _ => return None,
        })
    }

    fn describe(self) -> &'static str {
        match self {
            Cause::Divide => "divide by zero",
            Cause::Debug => "debug trap",
            Cause::Breakpoint => "breakpoint",
            Cause::Overflow => "overflow",
            Cause::BoundCheck => "bound check failed",
            Cause::Opcode => "bad opcode",
            Cause::NoFpu => "no FPU present",
            Cause::SegFault => "segment not present",
            Cause::StackFault => "stack fault",
            Cause::ProtFault => "protection fault",
            Cause::PageFault => "page fault",
            Cause::FpuFault => "FPU fault",
            Cause::AlignFault => "alignment fault",
            Cause::SimdFault => "SIMD fault",
        }
    }
}

// ============================================================================
// Register Snapshot
// ============================================================================

/// The register image handed to a swexn handler, in stack order.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Ureg {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Size of [`Ureg`] in words.
pub const UREG_WORDS: usize = 20;
/// Size of [`Ureg`] in bytes.
pub const UREG_BYTES: u32 = (UREG_WORDS * 4) as u32;

impl Ureg {
    /// Serialize to the little-endian words user space expects.
    pub fn to_words(&self) -> [u32; UREG_WORDS] {
        [
            self.cause,
            self.cr2,
            self.ds,
            self.es,
            self.fs,
            self.gs,
            self.edi,
            self.esi,
            self.ebp,
            self.zero,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]
    }

    /// Snapshot the interrupted user state from an exception-layout
    /// trap frame.
    ///
    /// # Safety
    /// `esp0` must carry a complete exception frame.
    pub unsafe fn from_exception_frame(esp0: usize, cause: Cause, cr2: u32) -> Ureg {
        Ureg {
            cause: cause as u32,
            cr2,
            ds: trap_word(esp0, frame::EXC_DS),
            es: trap_word(esp0, frame::EXC_ES),
            fs: trap_word(esp0, frame::EXC_FS),
            gs: trap_word(esp0, frame::EXC_GS),
            edi: trap_word(esp0, frame::EXC_EDI),
            esi: trap_word(esp0, frame::EXC_ESI),
            ebp: trap_word(esp0, frame::EXC_EBP),
            zero: 0,
            ebx: trap_word(esp0, frame::EXC_EBX),
            edx: trap_word(esp0, frame::EXC_EDX),
            ecx: trap_word(esp0, frame::EXC_ECX),
            eax: trap_word(esp0, frame::EXC_EAX),
            error_code: trap_word(esp0, frame::EXC_ERROR),
            eip: trap_word(esp0, frame::EIP),
            cs: trap_word(esp0, frame::CS),
            eflags: trap_word(esp0, frame::EFLAGS),
            esp: trap_word(esp0, frame::ESP),
            ss: trap_word(esp0, frame::SS),
        }
    }
}

// ============================================================================
// Delivery
// ============================================================================

/// Give the faulting thread's swexn handler a chance; kill the thread
/// if it has none or its handler stack is unusable.
///
/// On hardware this launches the handler and does not come back; in the
/// hosted harness a successful delivery returns after recording the
/// launch.
pub fn deliver_or_die(cause: Cause, cr2: Option<u32>) {
    let me = thread::get_self();

    let registered = me.swexn.lock().take();
    if let Some(handler) = registered {
        let proc = match process::get(me.pid()) {
            Some(p) => p,
            None => kernel_panic("faulting thread has no process"),
        };

        // The frame lands below esp3: the ureg plus the argument triple.
        let needed = UREG_BYTES + 3 * 4;
        let base = handler.esp3.wrapping_sub(needed);
        let writable = {
            let dir = proc.pagedir.lock();
            crate::syscall::helper::check_buffer(&dir, base, needed as usize, true)
        };

        if writable {
            let ureg_addr = handler.esp3 - UREG_BYTES;
            let arg_base = ureg_addr - 2 * 4;

            let ureg =
                // SAFETY: the trap wrapper left a full exception frame
                // on this thread's kernel stack.
                unsafe { Ureg::from_exception_frame(me.esp0(), cause, cr2.unwrap_or(0)) };

            {
                let dir = proc.pagedir.lock();
                let words = ureg.to_words();
                for (i, w) in words.iter().enumerate() {
                    usermem::write_u32(&dir, ureg_addr + (i * 4) as u32, *w);
                }
                // {fake return, arg, &ureg}, fake return on top.
                usermem::write_u32(&dir, arg_base - 4, 0);
                usermem::write_u32(&dir, arg_base, handler.arg);
                usermem::write_u32(&dir, arg_base + 4, ureg_addr);
            }

            crate::kern::context::launch(handler.eip, arg_base - 4);
            return;
        }
        // Handler stack is garbage; fall through and die.
    }

    thread_panic(cause.describe());
}

/// Entry point for non-page-fault exceptions.
///
/// The origin decides everything: a user-mode fault goes to delivery, a
/// kernel-mode fault means internal state is gone and the kernel stops.
/// The replaying traps (debug, breakpoint, overflow) re-enter user code
/// after delivery like any other cause.
pub fn exception_handler(cause: u32, _error_code: u32) {
    let cause = match Cause::from_vector(cause) {
        Some(c) => c,
        None => kernel_panic("unknown exception vector"),
    };

    let me = thread::get_self();
    // SAFETY: the exception wrapper saved a full frame.
    let cs = unsafe { trap_word(me.esp0(), frame::CS) };

    if cs & 0x3 == 0x3 {
        // User-mode fault.
        deliver_or_die(cause, None);
        return;
    }

    kernel_panic(cause.describe());
}
