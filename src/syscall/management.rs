//! Thread management system calls
//!
//! gettid, yield, deschedule, make_runnable, sleep, get_ticks and
//! swexn. The suspension calls share one shape: raise the do-not-switch
//! veto, move the caller to its destination list, pick the next thread
//! (falling back to idle) and switch.

use crate::drivers::timer::{self, dont_switch_me_out, you_can_switch_me_out_now};
use crate::errors::{to_syscall_ret, KernError, KernResult};
use crate::kern::context::{self, frame, set_trap_word, trap_word};
use crate::kern::exception::UREG_WORDS;
use crate::kern::thread::{self, Swexn, ThrState};
use crate::syscall::helper;
use crate::types::{Tid, VAddr};
use crate::vm::usermem;
use crate::arch::{AUTHORIZED_FLAGS, SEGSEL_USER_CS, SEGSEL_USER_DS};

// ============================================================================
// gettid / get_ticks
// ============================================================================

/// The calling thread's tid.
pub fn sys_gettid() -> i32 {
    thread::get_self().tid().0 as i32
}

/// Timer ticks since boot.
pub fn sys_get_ticks() -> i32 {
    timer::get_time() as i32
}

// ============================================================================
// yield
// ============================================================================

/// Hand the CPU to `tid`, or to the next thread in line for −1. The
/// caller stays runnable either way.
pub fn yield_to(tid: i32) -> KernResult<i32> {
    let me = thread::get_self();

    // A named target must be runnable right now.
    let mut other = None;
    if tid >= 0 {
        let target = thread::get_thread(Tid(tid as u32))
            .filter(|t| t.state() == ThrState::Running)
            .ok_or(KernError::YieldNotRunnable)?;
        other = Some(target);
    }

    // Between leaving the queue and landing at its tail the queue head
    // is not the CPU holder; the veto covers the window.
    dont_switch_me_out();
    thread::set_runnable(&me)?;

    let other = match other.or_else(thread::get_running) {
        Some(t) => t,
        None => me.clone(),
    };

    context::context_switch(&me, &other);
    Ok(0)
}

pub fn sys_yield(tid: i32) -> i32 {
    to_syscall_ret(yield_to(tid))
}

// ============================================================================
// deschedule / make_runnable
// ============================================================================

/// Block the caller. Checked against `*flag` atomically with respect to
/// make_runnable on the same thread, so a wakeup that raced ahead of
/// the deschedule is not lost.
pub fn sys_deschedule(flag_ptr: u32) -> i32 {
    let me = thread::get_self();
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    {
        let dir = proc.pagedir.lock();
        if !helper::check_page(&dir, flag_ptr, false) {
            return KernError::InvalidArg.code();
        }
    }

    me.thread_lock.lock();
    let flag = usermem::read_u32(&proc.pagedir.lock(), flag_ptr);
    if flag != 0 {
        me.thread_lock.unlock();
        return 0;
    }

    dont_switch_me_out();
    me.thread_lock.unlock();

    if let Err(e) = thread::set_blocked(&me) {
        you_can_switch_me_out_now();
        return e.code();
    }

    let other = next_or_idle();
    context::context_switch(&me, &other);
    0
}

/// Kernel-internal deschedule with an always-clear flag; the condvar
/// wait path uses it.
pub fn deschedule_self() {
    let me = thread::get_self();

    me.thread_lock.lock();
    dont_switch_me_out();
    me.thread_lock.unlock();

    if thread::set_blocked(&me).is_err() {
        you_can_switch_me_out_now();
        return;
    }

    let other = next_or_idle();
    context::context_switch(&me, &other);
}

/// Wake a descheduled thread and hand it the CPU.
pub fn make_runnable_tid(tid: Tid) -> KernResult<()> {
    let target = thread::get_thread(tid)
        .filter(|t| t.state() == ThrState::Blocked)
        .ok_or(KernError::NotBlocked)?;

    let me = thread::get_self();

    // Atomic against the target's own deschedule.
    target.thread_lock.lock();
    dont_switch_me_out();
    let res = thread::set_runnable(&target);
    target.thread_lock.unlock();

    match res {
        Ok(()) => {
            context::context_switch(&me, &target);
            Ok(())
        }
        Err(e) => {
            you_can_switch_me_out_now();
            Err(e)
        }
    }
}

pub fn sys_make_runnable(tid: i32) -> i32 {
    if tid < 0 {
        return KernError::InvalidTid.code();
    }
    to_syscall_ret(make_runnable_tid(Tid(tid as u32)).map(|_| 0))
}

// ============================================================================
// sleep
// ============================================================================

/// Deschedule the caller for at least `ticks` timer interrupts.
pub fn sys_sleep(ticks: i32) -> i32 {
    if ticks == 0 {
        return 0;
    }
    if ticks < 0 {
        return KernError::NegativeSleep.code();
    }

    let me = thread::get_self();

    dont_switch_me_out();
    if let Err(e) = thread::set_sleeping(&me, ticks as u32) {
        you_can_switch_me_out_now();
        return e.code();
    }

    let other = next_or_idle();
    context::context_switch(&me, &other);
    0
}

/// Next runnable thread, or idle when the queue is empty.
fn next_or_idle() -> alloc::sync::Arc<thread::Thread> {
    match thread::get_running().or_else(thread::idle) {
        Some(t) => t,
        None => crate::panic::kernel_panic("nothing left to run"),
    }
}

// ============================================================================
// swexn
// ============================================================================

/// Register, replace or remove the caller's software exception handler,
/// optionally adopting a new register set on the way back to user mode.
///
/// Packet: `{esp3, eip, arg, newureg*}`. A null esp3 or eip
/// deregisters. A newureg may change the general-purpose registers,
/// esp and eip freely (bad values fault in user mode, which is the
/// user's own problem), the data segments only to user selectors, and
/// eflags only within the authorized mask. If any part of the request
/// is invalid nothing at all is changed.
pub fn sys_swexn(packet: u32) -> i32 {
    let me = thread::get_self();
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };
    let esp0 = me.esp0();

    let (esp3, eip, arg, newureg) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 4) {
            return KernError::InvalidArg.code();
        }
        let esp3 = usermem::read_u32(&dir, packet);
        let eip = usermem::read_u32(&dir, packet + 4);
        let arg = usermem::read_u32(&dir, packet + 8);
        let newureg = usermem::read_u32(&dir, packet + 12);

        if esp3 != 0 && !helper::check_page(&dir, esp3, true) {
            return KernError::InvalidArg.code();
        }
        if eip != 0
            && (!helper::check_page(&dir, eip, false) || eip < crate::vm::USER_MEM_START)
        {
            return KernError::InvalidArg.code();
        }
        if newureg != 0 && !helper::check_array(&dir, newureg, UREG_WORDS) {
            return KernError::InvalidArg.code();
        }
        (esp3, eip, arg, newureg)
    };

    // Pull in and vet the requested register image before touching
    // anything, so a rejected request has no side effects.
    let mut adopted = [0u32; UREG_WORDS];
    if newureg != 0 {
        let dir = proc.pagedir.lock();
        for (i, word) in adopted.iter_mut().enumerate() {
            *word = usermem::read_u32(&dir, newureg + (i * 4) as u32);
        }

        let ds = adopted[2];
        let es = adopted[3];
        let fs = adopted[4];
        let gs = adopted[5];
        let eflags = adopted[17];
        let seg_ok = |s: u32| s == u32::from(SEGSEL_USER_DS) || s == u32::from(SEGSEL_USER_CS);
        // SAFETY: our own trap frame.
        let cur_eflags = unsafe { trap_word(esp0, frame::EFLAGS) };
        if !seg_ok(ds)
            || !seg_ok(es)
            || !seg_ok(fs)
            || !seg_ok(gs)
            || (eflags ^ cur_eflags) & !AUTHORIZED_FLAGS != 0
        {
            return KernError::InvalidArg.code();
        }
    }

    if esp3 == 0 || eip == 0 {
        *me.swexn.lock() = None;
    } else {
        *me.swexn.lock() = Some(Swexn {
            eip: eip as VAddr,
            esp3: esp3 as VAddr,
            arg,
        });
    }

    if newureg != 0 {
        // Overwrite the interrupted frame; iret restores this state.
        // cs and ss are never touched.
        // SAFETY: our own trap frame, laid out by the syscall wrapper.
        unsafe {
            set_trap_word(esp0, frame::SYS_DS, adopted[2]);
            set_trap_word(esp0, frame::SYS_ES, adopted[3]);
            set_trap_word(esp0, frame::SYS_FS, adopted[4]);
            set_trap_word(esp0, frame::SYS_GS, adopted[5]);
            set_trap_word(esp0, frame::SYS_EDI, adopted[6]);
            set_trap_word(esp0, frame::SYS_ESI, adopted[7]);
            set_trap_word(esp0, frame::SYS_EBP, adopted[8]);
            set_trap_word(esp0, frame::SYS_EBX, adopted[10]);
            set_trap_word(esp0, frame::SYS_EDX, adopted[11]);
            set_trap_word(esp0, frame::SYS_ECX, adopted[12]);
            set_trap_word(esp0, frame::ESP, adopted[18]);
            set_trap_word(esp0, frame::EIP, adopted[15]);
            let cur = trap_word(esp0, frame::EFLAGS);
            set_trap_word(esp0, frame::EFLAGS, cur | (adopted[17] & AUTHORIZED_FLAGS));
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::page::create_page;
    use crate::vm::{MemType, USER_MEM_START};

    #[test]
    fn test_gettid() {
        let env = testutil::kernel_test_env();
        let (_god, me) = env.boot();
        assert_eq!(sys_gettid(), me.tid().0 as i32);
    }

    #[test]
    fn test_yield_rotates() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();
        let other = thread::create_thread(&god).unwrap();
        thread::set_runnable(&other).unwrap();

        assert_eq!(sys_yield(-1), 0);
        assert_eq!(thread::get_self().tid(), other.tid());
        // The yielder stayed runnable.
        assert_eq!(me.state(), ThrState::Running);
    }

    #[test]
    fn test_yield_to_named_thread() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        let a = thread::create_thread(&god).unwrap();
        let b = thread::create_thread(&god).unwrap();
        thread::set_runnable(&a).unwrap();
        thread::set_runnable(&b).unwrap();

        assert_eq!(sys_yield(b.tid().0 as i32), 0);
        assert_eq!(thread::get_self().tid(), b.tid());
    }

    #[test]
    fn test_yield_to_unrunnable_fails() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();
        let parked = thread::create_thread(&god).unwrap();
        thread::set_blocked(&parked).unwrap();

        assert_eq!(
            sys_yield(parked.tid().0 as i32),
            KernError::YieldNotRunnable.code()
        );
        // No tid matches either.
        assert_eq!(sys_yield(999_999), KernError::YieldNotRunnable.code());
        assert_eq!(thread::get_self().tid(), me.tid());
    }

    #[test]
    fn test_make_runnable_requires_blocked() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        let t = thread::create_thread(&god).unwrap();
        thread::set_runnable(&t).unwrap();
        // Runnable, not blocked.
        assert_eq!(
            sys_make_runnable(t.tid().0 as i32),
            KernError::NotBlocked.code()
        );

        thread::set_blocked(&t).unwrap();
        assert_eq!(sys_make_runnable(t.tid().0 as i32), 0);
        assert_eq!(t.state(), ThrState::Running);
    }

    #[test]
    fn test_deschedule_respects_flag() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        let flag_va = USER_MEM_START + 0x3000;
        create_page(&mut god.pagedir.lock(), flag_va, MemType::User, None).unwrap();

        // Nonzero flag: no-op.
        usermem::write_u32(&god.pagedir.lock(), flag_va, 1);
        assert_eq!(sys_deschedule(flag_va), 0);
        assert_eq!(me.state(), ThrState::Running);

        // Bad pointer.
        assert_eq!(
            sys_deschedule(USER_MEM_START + 0x8000),
            KernError::InvalidArg.code()
        );
    }

    #[test]
    fn test_sleep_validates() {
        let env = testutil::kernel_test_env();
        env.boot();
        assert_eq!(sys_sleep(0), 0);
        assert_eq!(sys_sleep(-5), KernError::NegativeSleep.code());
    }

    #[test]
    fn test_swexn_register_and_deregister() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        let page = USER_MEM_START + 0x4000;
        create_page(&mut god.pagedir.lock(), page, MemType::User, None).unwrap();
        testutil::write_syscall_frame(&me, 0x0100_0040, page + 0x800);

        // Packet in user memory: {esp3, eip, arg, newureg=0}.
        let pkt = page;
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, pkt, page + 0x800);
            usermem::write_u32(&dir, pkt + 4, USER_MEM_START + 0x4100);
            usermem::write_u32(&dir, pkt + 8, 42);
            usermem::write_u32(&dir, pkt + 12, 0);
        }

        assert_eq!(sys_swexn(pkt), 0);
        let reg = (*me.swexn.lock()).unwrap();
        assert_eq!(reg.arg, 42);
        assert_eq!(reg.esp3, page + 0x800);

        // Null eip deregisters.
        usermem::write_u32(&god.pagedir.lock(), pkt + 4, 0);
        assert_eq!(sys_swexn(pkt), 0);
        assert!(me.swexn.lock().is_none());
    }

    #[test]
    fn test_swexn_rejects_bad_newureg() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        let page = USER_MEM_START + 0x4000;
        create_page(&mut god.pagedir.lock(), page, MemType::User, None).unwrap();
        testutil::write_syscall_frame(&me, 0x0100_0040, page + 0x800);

        let pkt = page;
        let ureg = page + 0x200;
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, pkt, page + 0x800);
            usermem::write_u32(&dir, pkt + 4, USER_MEM_START + 0x4100);
            usermem::write_u32(&dir, pkt + 8, 0);
            usermem::write_u32(&dir, pkt + 12, ureg);
            // newureg with a kernel data segment: rejected.
            usermem::write_u32(&dir, ureg + 2 * 4, 0x18);
        }

        assert_eq!(sys_swexn(pkt), KernError::InvalidArg.code());
        // The rejected request changed nothing.
        assert!(me.swexn.lock().is_none());
    }

    #[test]
    fn test_swexn_adopts_registers() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        let page = USER_MEM_START + 0x4000;
        create_page(&mut god.pagedir.lock(), page, MemType::User, None).unwrap();
        testutil::write_syscall_frame(&me, 0x0100_0040, page + 0x800);

        let pkt = page;
        let ureg = page + 0x200;
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, pkt, page + 0x800);
            usermem::write_u32(&dir, pkt + 4, USER_MEM_START + 0x4100);
            usermem::write_u32(&dir, pkt + 8, 0);
            usermem::write_u32(&dir, pkt + 12, ureg);

            for i in 2..6 {
                usermem::write_u32(&dir, ureg + i * 4, u32::from(SEGSEL_USER_DS));
            }
            usermem::write_u32(&dir, ureg + 15 * 4, 0x0100_9999); // eip
            // eflags: flip only an authorized bit (carry).
            // SAFETY: frame just written by the helper above.
            let cur = unsafe { trap_word(me.esp0(), frame::EFLAGS) };
            usermem::write_u32(&dir, ureg + 17 * 4, cur | 1);
            usermem::write_u32(&dir, ureg + 18 * 4, page + 0x700); // esp
        }

        assert_eq!(sys_swexn(pkt), 0);
        // SAFETY: reading back our own forged frame.
        unsafe {
            assert_eq!(trap_word(me.esp0(), frame::EIP), 0x0100_9999);
            assert_eq!(trap_word(me.esp0(), frame::ESP), page + 0x700);
            assert_eq!(trap_word(me.esp0(), frame::EFLAGS) & 1, 1);
        }
    }
}
