//! PIT timer driver and the time-slicing path
//!
//! The timer fires 100 times a second. Each tick bumps the clock, wakes
//! any sleepers that are due, and rotates the runnable queue; the idle
//! thread is dropped from the queue as soon as real work exists and
//! picked back up when nothing else runs.
//!
//! The do-not-switch flag lives here. A thread raises it before any
//! operation that leaves the runnable queue inconsistent with reality
//! (removed from the queue but still on the CPU); the tick handler
//! treats a raised flag as a veto and just acknowledges the interrupt.
//! The flag drops at the end of the next context switch.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::{self, SEGSEL_KERNEL_CS};
use crate::drivers::ack_interrupt;
use crate::interrupt::{self, vector, TrapGate};
use crate::kern::{context, thread};

/// PIT input frequency in Hz.
const TIMER_RATE: u32 = 1_193_182;
/// Ticks delivered per second.
pub const TIMER_INTERRUPT_RATE: u32 = 100;
const TIMER_CYCLES_PER_INTERRUPT: u32 = TIMER_RATE / TIMER_INTERRUPT_RATE;

/// PIT programming ports
const TIMER_MODE_IO_PORT: u16 = 0x43;
const TIMER_PERIOD_IO_PORT: u16 = 0x40;
const TIMER_SQUARE_WAVE: u8 = 0x36;

/// Ticks since boot. Wraps after ~500 days; sleeping math wraps with it.
static NUM_TICKS: AtomicU32 = AtomicU32::new(0);

/// The context-switch veto.
static NO_SWITCH: AtomicBool = AtomicBool::new(false);

// ============================================================================
// Setup
// ============================================================================

/// Install the tick handler and start the hardware clock.
pub fn init_timer() {
    let gate = TrapGate {
        segment: SEGSEL_KERNEL_CS,
        offset: timer_entry_offset(),
        privilege_level: 0,
    };
    interrupt::insert_to_idt(interrupt::create_trap_idt_entry(&gate), vector::TIMER);

    let period = TIMER_CYCLES_PER_INTERRUPT as u16;
    arch::outb(TIMER_MODE_IO_PORT, TIMER_SQUARE_WAVE);
    arch::outb(TIMER_PERIOD_IO_PORT, (period & 0xff) as u8);
    arch::outb(TIMER_PERIOD_IO_PORT, (period >> 8) as u8);
}

#[cfg(all(target_arch = "x86", not(test)))]
fn timer_entry_offset() -> u32 {
    crate::kern::context::stubs::timer_interrupt_stub as usize as u32
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn timer_entry_offset() -> u32 {
    0
}

// ============================================================================
// The Tick
// ============================================================================

/// One timer interrupt.
pub fn timer_handler() {
    let now = NUM_TICKS.fetch_add(1, Ordering::AcqRel) + 1;

    if no_switch() {
        ack_interrupt();
        return;
    }

    // Wake every sleeper that is due, oldest deadline first.
    let mut awoken = false;
    while let Some(head) = thread::get_sleeping() {
        if head.wake() > now {
            break;
        }
        let _ = thread::set_runnable(&head);
        awoken = true;
    }

    // Idle yields the instant real work appears.
    if awoken {
        let me = thread::get_self();
        if thread::is_idle(&me) {
            let _ = thread::unset_state(&me);
            let other = thread::get_running();
            dont_switch_me_out();
            ack_interrupt();
            if let Some(other) = other {
                context::context_switch(&me, &other);
            }
            return;
        }
    }

    // Time slicing. Idle keeps the queue non-empty, so "another thread
    // exists" means the queue is longer than one.
    let me = thread::get_self();
    let mut other = None;
    if !thread::is_idle(&me) {
        let _ = thread::set_runnable(&me);
        other = thread::get_running();
    } else if thread::num_runnable() > 1 {
        let _ = thread::unset_state(&me);
        other = thread::get_running();
    }

    dont_switch_me_out();
    ack_interrupt();
    match other {
        Some(other) => context::context_switch(&me, &other),
        None => you_can_switch_me_out_now(),
    }
}

// ============================================================================
// Clock and Veto
// ============================================================================

/// Ticks since boot.
pub fn get_time() -> u32 {
    NUM_TICKS.load(Ordering::Acquire)
}

/// Is the context-switch veto raised?
pub fn no_switch() -> bool {
    NO_SWITCH.load(Ordering::Acquire)
}

/// Raise the veto: the runnable queue is about to stop reflecting who
/// holds the CPU.
pub fn dont_switch_me_out() {
    NO_SWITCH.store(true, Ordering::Release);
}

/// Drop the veto.
pub fn you_can_switch_me_out_now() {
    NO_SWITCH.store(false, Ordering::Release);
}

/// Zero the clock and drop the veto (tests only).
#[cfg(test)]
pub fn reset_for_tests() {
    NUM_TICKS.store(0, Ordering::Release);
    NO_SWITCH.store(false, Ordering::Release);
}

/// Advance the clock by firing the tick handler (tests only).
#[cfg(test)]
pub fn tick_for_tests(n: u32) {
    for _ in 0..n {
        timer_handler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    #[test]
    fn test_ticks_advance() {
        let env = testutil::kernel_test_env();
        env.boot();
        assert_eq!(get_time(), 0);
        tick_for_tests(3);
        assert_eq!(get_time(), 3);
    }

    #[test]
    fn test_no_switch_vetoes_rotation() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();
        let other = thread::create_thread(&god).unwrap();
        thread::set_runnable(&other).unwrap();

        dont_switch_me_out();
        tick_for_tests(1);
        // Clock moved but the head did not.
        assert_eq!(get_time(), 1);
        assert_eq!(thread::get_self().tid(), me.tid());
        you_can_switch_me_out_now();

        tick_for_tests(1);
        // Now the slice rotated to the other thread.
        assert_eq!(thread::get_self().tid(), other.tid());
    }

    #[test]
    fn test_sleepers_wake_in_deadline_order() {
        let env = testutil::kernel_test_env();
        let (god, me) = env.boot();

        let a = thread::create_thread(&god).unwrap();
        let b = thread::create_thread(&god).unwrap();
        let c = thread::create_thread(&god).unwrap();
        thread::set_sleeping(&a, 3).unwrap();
        thread::set_sleeping(&b, 1).unwrap();
        thread::set_sleeping(&c, 2).unwrap();

        tick_for_tests(1);
        assert_eq!(b.state(), thread::ThrState::Running);
        assert_eq!(c.state(), thread::ThrState::Sleeping);

        tick_for_tests(1);
        assert_eq!(c.state(), thread::ThrState::Running);
        assert_eq!(a.state(), thread::ThrState::Sleeping);

        tick_for_tests(1);
        assert_eq!(a.state(), thread::ThrState::Running);
        assert!(thread::get_sleeping().is_none());
        let _ = me;
    }

    #[test]
    fn test_lone_thread_keeps_cpu() {
        let env = testutil::kernel_test_env();
        let (_god, me) = env.boot();
        tick_for_tests(5);
        assert_eq!(thread::get_self().tid(), me.tid());
    }
}
