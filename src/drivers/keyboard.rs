//! PS/2 keyboard driver
//!
//! The interrupt handler reads raw scancodes into a bounded ring and
//! signals a condition variable; `readchar` drains the ring, decoding
//! make codes into characters, and blocks on the condvar when the ring
//! runs dry. A scancode arriving while the ring is full is dropped:
//! what the user typed first should come out first, so the oldest input
//! wins.
//!
//! The condvar is signaled only after the interrupt is acknowledged, so
//! interrupts keep flowing even if the wakeup path stalls.

use heapless::Deque;
use spin::{Mutex, Once};

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{self, SEGSEL_KERNEL_CS};
use crate::drivers::ack_interrupt;
use crate::interrupt::{self, vector, TrapGate};
use crate::lock::condvar::KCondvar;
use crate::lock::mutex::KMutex;

/// Scancode ring capacity.
pub const KEY_BUFFER_SIZE: usize = 256;
/// Longest line readline accepts.
pub const MAX_LINE_LENGTH: usize = 4096;

/// PS/2 data port
const KEYBOARD_PORT: u16 = 0x60;

struct Keyboard {
    /// Serializes consumers and the handler on the ring.
    mutex: KMutex,
    /// Signaled after each buffered scancode.
    new_key: KCondvar,
    /// Raw scancodes, oldest first.
    ring: Mutex<Deque<u8, KEY_BUFFER_SIZE>>,
}

static KEYBOARD: Once<Keyboard> = Once::new();

/// Shift keys currently held.
static SHIFT: AtomicBool = AtomicBool::new(false);

fn keyboard() -> &'static Keyboard {
    KEYBOARD.call_once(|| Keyboard {
        mutex: KMutex::new(),
        new_key: KCondvar::new(),
        ring: Mutex::new(Deque::new()),
    })
}

/// Install the keyboard IDT entry.
pub fn init_keyboard() {
    let _ = keyboard();
    let gate = TrapGate {
        segment: SEGSEL_KERNEL_CS,
        offset: keyboard_entry_offset(),
        privilege_level: 0,
    };
    interrupt::insert_to_idt(interrupt::create_trap_idt_entry(&gate), vector::KEYBOARD);
}

#[cfg(all(target_arch = "x86", not(test)))]
fn keyboard_entry_offset() -> u32 {
    crate::kern::context::stubs::keyboard_interrupt_stub as usize as u32
}

#[cfg(not(all(target_arch = "x86", not(test))))]
fn keyboard_entry_offset() -> u32 {
    0
}

/// The keyboard interrupt: buffer the scancode, ack, then wake readers.
pub fn keyboard_handler() {
    let kb = keyboard();

    kb.mutex.lock();
    let scancode = arch::inb(KEYBOARD_PORT);
    // A full ring drops the newcomer.
    let _ = kb.ring.lock().push_back(scancode);
    kb.mutex.unlock();

    ack_interrupt();
    kb.new_key.signal();
}

/// Feed a scancode as the interrupt handler would (tests only).
#[cfg(test)]
pub fn push_scancode_for_tests(scancode: u8) {
    let _ = keyboard().ring.lock().push_back(scancode);
}

/// Empty the ring and shift state (tests only).
#[cfg(test)]
pub fn reset_for_tests() {
    keyboard().ring.lock().clear();
    SHIFT.store(false, Ordering::Release);
}

/// Next typed character. Blocks until a decodable make code arrives.
pub fn readchar() -> u8 {
    let kb = keyboard();

    kb.mutex.lock();
    let ch = loop {
        let sc = kb.ring.lock().pop_front();
        match sc {
            Some(sc) => {
                if let Some(ch) = process_scancode(sc) {
                    break ch;
                }
            }
            None => kb.new_key.wait(&kb.mutex),
        }
    };
    kb.mutex.unlock();

    ch
}

/// Non-blocking variant: next decodable character already buffered.
pub fn try_readchar() -> Option<u8> {
    let kb = keyboard();
    kb.mutex.lock();
    let mut found = None;
    while let Some(sc) = kb.ring.lock().pop_front() {
        if let Some(ch) = process_scancode(sc) {
            found = Some(ch);
            break;
        }
    }
    kb.mutex.unlock();
    found
}

// ============================================================================
// Scancode Decoding
// ============================================================================

const SC_LSHIFT: u8 = 0x2a;
const SC_RSHIFT: u8 = 0x36;
const BREAK_BIT: u8 = 0x80;

/// Decode one scancode (US layout). Returns the character for a make
/// code with data; tracks shift state; ignores everything else.
fn process_scancode(scancode: u8) -> Option<u8> {
    // Break codes: only shift releases matter.
    if scancode & BREAK_BIT != 0 {
        let make = scancode & !BREAK_BIT;
        if make == SC_LSHIFT || make == SC_RSHIFT {
            SHIFT.store(false, Ordering::Release);
        }
        return None;
    }

    if scancode == SC_LSHIFT || scancode == SC_RSHIFT {
        SHIFT.store(true, Ordering::Release);
        return None;
    }

    let (plain, shifted) = match scancode {
        0x02 => (b'1', b'!'),
        0x03 => (b'2', b'@'),
        0x04 => (b'3', b'#'),
        0x05 => (b'4', b'$'),
        0x06 => (b'5', b'%'),
        0x07 => (b'6', b'^'),
        0x08 => (b'7', b'&'),
        0x09 => (b'8', b'*'),
        0x0a => (b'9', b'('),
        0x0b => (b'0', b')'),
        0x0c => (b'-', b'_'),
        0x0d => (b'=', b'+'),
        0x0e => (b'\x08', b'\x08'), // backspace
        0x0f => (b'\t', b'\t'),
        0x10 => (b'q', b'Q'),
        0x11 => (b'w', b'W'),
        0x12 => (b'e', b'E'),
        0x13 => (b'r', b'R'),
        0x14 => (b't', b'T'),
        0x15 => (b'y', b'Y'),
        0x16 => (b'u', b'U'),
        0x17 => (b'i', b'I'),
        0x18 => (b'o', b'O'),
        0x19 => (b'p', b'P'),
        0x1a => (b'[', b'{'),
        0x1b => (b']', b'}'),
        0x1c => (b'\n', b'\n'), // enter
        0x1e => (b'a', b'A'),
        0x1f => (b's', b'S'),
        0x20 => (b'd', b'D'),
        0x21 => (b'f', b'F'),
        0x22 => (b'g', b'G'),
        0x23 => (b'h', b'H'),
        0x24 => (b'j', b'J'),
        0x25 => (b'k', b'K'),
        0x26 => (b'l', b'L'),
        0x27 => (b';', b':'),
        0x28 => (b'\'', b'"'),
        0x29 => (b'`', b'~'),
        0x2b => (b'\\', b'|'),
        0x2c => (b'z', b'Z'),
        0x2d => (b'x', b'X'),
        0x2e => (b'c', b'C'),
        0x2f => (b'v', b'V'),
        0x30 => (b'b', b'B'),
        0x31 => (b'n', b'N'),
        0x32 => (b'm', b'M'),
        0x33 => (b',', b'<'),
        0x34 => (b'.', b'>'),
        0x35 => (b'/', b'?'),
        0x39 => (b' ', b' '),
        _ => return None,
    };

    Some(if SHIFT.load(Ordering::Acquire) {
        shifted
    } else {
        plain
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    #[test]
    fn test_scancode_decoding() {
        let _env = testutil::kernel_test_env();
        assert_eq!(process_scancode(0x1e), Some(b'a'));
        assert_eq!(process_scancode(0x1c), Some(b'\n'));
        assert_eq!(process_scancode(0x39), Some(b' '));
        // Break codes carry no data.
        assert_eq!(process_scancode(0x1e | BREAK_BIT), None);
        // Unknown scancodes are swallowed.
        assert_eq!(process_scancode(0x7f), None);
    }

    #[test]
    fn test_shift_state() {
        let _env = testutil::kernel_test_env();
        reset_for_tests();
        assert_eq!(process_scancode(SC_LSHIFT), None);
        assert_eq!(process_scancode(0x1e), Some(b'A'));
        assert_eq!(process_scancode(0x03), Some(b'@'));
        assert_eq!(process_scancode(SC_LSHIFT | BREAK_BIT), None);
        assert_eq!(process_scancode(0x1e), Some(b'a'));
    }

    #[test]
    fn test_ring_preserves_typed_order() {
        let env = testutil::kernel_test_env();
        env.boot();
        reset_for_tests();
        push_scancode_for_tests(0x23); // h
        push_scancode_for_tests(0x17); // i
        push_scancode_for_tests(0x1c); // \n
        assert_eq!(try_readchar(), Some(b'h'));
        assert_eq!(try_readchar(), Some(b'i'));
        assert_eq!(try_readchar(), Some(b'\n'));
        assert_eq!(try_readchar(), None);
    }

    #[test]
    fn test_full_ring_drops_newest() {
        let env = testutil::kernel_test_env();
        env.boot();
        reset_for_tests();
        for _ in 0..KEY_BUFFER_SIZE {
            push_scancode_for_tests(0x1e); // a
        }
        // The ring is full; this h never makes it in.
        push_scancode_for_tests(0x23);
        let mut last = None;
        while let Some(c) = try_readchar() {
            last = Some(c);
        }
        assert_eq!(last, Some(b'a'));
    }
}
