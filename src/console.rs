//! VGA text console for Granite
//!
//! Owns the 80x25 text-mode display: character output with the control
//! characters user programs rely on (`\n`, `\r`, `\b`), scrolling, the
//! hardware cursor and the output color. Also exports the `print!` /
//! `println!` macros the rest of the kernel logs through.
//!
//! When a function is handed an out-of-range screen position it simply
//! does nothing; positions are validated here, pointer arguments are the
//! system calls' problem.

use core::fmt::{self, Write};
use spin::Mutex;

use crate::arch;

/// Screen width in characters
pub const CONSOLE_WIDTH: usize = 80;
/// Screen height in characters
pub const CONSOLE_HEIGHT: usize = 25;

/// Default output color: white on black.
pub const DEFAULT_COLOR: u8 = 0x07;

/// VGA text buffer base
#[allow(dead_code)]
const VIDEO_BASE: usize = 0xb8000;

/// CRTC register ports for the hardware cursor
#[allow(dead_code)]
const CRTC_IDX: u16 = 0x3d4;
#[allow(dead_code)]
const CRTC_DATA: u16 = 0x3d5;
#[allow(dead_code)]
const CRTC_CURSOR_MSB: u8 = 0x0e;
#[allow(dead_code)]
const CRTC_CURSOR_LSB: u8 = 0x0f;

/// Console state: cursor position, visibility and color.
pub struct Console {
    row: usize,
    col: usize,
    hidden: bool,
    color: u8,
    /// Shadow cell buffer for builds without VGA memory (tests).
    #[cfg(not(all(target_arch = "x86", not(test))))]
    cells: [u16; CONSOLE_WIDTH * CONSOLE_HEIGHT],
}

impl Console {
    pub const fn new() -> Self {
        Console {
            row: 0,
            col: 0,
            hidden: false,
            color: DEFAULT_COLOR,
            #[cfg(not(all(target_arch = "x86", not(test))))]
            cells: [0; CONSOLE_WIDTH * CONSOLE_HEIGHT],
        }
    }

    // === Cell access ===

    fn write_cell(&mut self, row: usize, col: usize, ch: u8, color: u8) {
        let idx = row * CONSOLE_WIDTH + col;
        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: idx < 80*25, inside the VGA text buffer.
        unsafe {
            let p = (VIDEO_BASE as *mut u16).add(idx);
            p.write_volatile(u16::from(ch) | (u16::from(color) << 8));
        }
        #[cfg(not(all(target_arch = "x86", not(test))))]
        {
            self.cells[idx] = u16::from(ch) | (u16::from(color) << 8);
        }
    }

    fn read_cell(&self, row: usize, col: usize) -> u16 {
        let idx = row * CONSOLE_WIDTH + col;
        #[cfg(all(target_arch = "x86", not(test)))]
        // SAFETY: idx < 80*25, inside the VGA text buffer.
        unsafe {
            (VIDEO_BASE as *const u16).add(idx).read_volatile()
        }
        #[cfg(not(all(target_arch = "x86", not(test))))]
        {
            self.cells[idx]
        }
    }

    /// Draw a character at an explicit position. A color of `None` keeps
    /// the color already on screen at that cell.
    fn draw_char(&mut self, row: usize, col: usize, ch: u8, color: Option<u8>) {
        if row >= CONSOLE_HEIGHT || col >= CONSOLE_WIDTH {
            return;
        }
        let color = color.unwrap_or((self.read_cell(row, col) >> 8) as u8);
        self.write_cell(row, col, ch, color);
    }

    // === Cursor ===

    fn set_cursor(&mut self, row: usize, col: usize) -> bool {
        if row >= CONSOLE_HEIGHT || col >= CONSOLE_WIDTH {
            return false;
        }
        self.row = row;
        self.col = col;
        if !self.hidden {
            self.send_curpos();
        }
        true
    }

    /// Push the stored position out to the CRTC. A hidden cursor is
    /// parked just past the visible screen.
    fn send_curpos(&self) {
        let pos = if self.hidden {
            CONSOLE_WIDTH * CONSOLE_HEIGHT
        } else {
            self.row * CONSOLE_WIDTH + self.col
        };
        arch::outb(CRTC_IDX, CRTC_CURSOR_MSB);
        arch::outb(CRTC_DATA, (pos >> 8) as u8);
        arch::outb(CRTC_IDX, CRTC_CURSOR_LSB);
        arch::outb(CRTC_DATA, (pos & 0xff) as u8);
    }

    /// Advance the cursor one cell, wrapping lines and scrolling at the
    /// bottom-right corner.
    fn next_cursor(&mut self) {
        if self.col + 1 < CONSOLE_WIDTH {
            self.col += 1;
        } else if self.row + 1 < CONSOLE_HEIGHT {
            self.col = 0;
            self.row += 1;
        } else {
            self.scroll();
            self.col = 0;
        }
        if !self.hidden {
            self.send_curpos();
        }
    }

    // === Scrolling ===

    fn scroll(&mut self) {
        for row in 1..CONSOLE_HEIGHT {
            for col in 0..CONSOLE_WIDTH {
                let cell = self.read_cell(row, col);
                let ch = (cell & 0xff) as u8;
                let color = (cell >> 8) as u8;
                self.write_cell(row - 1, col, ch, color);
            }
        }
        self.clear_row(CONSOLE_HEIGHT - 1);
    }

    fn clear_row(&mut self, row: usize) {
        for col in 0..CONSOLE_WIDTH {
            self.write_cell(row, col, b' ', self.color);
        }
    }

    // === Character output ===

    /// Print one byte at the cursor, interpreting `\n`, `\r` and `\b`.
    pub fn putbyte(&mut self, ch: u8) {
        let mut row = self.row;
        let col = self.col;

        match ch {
            b'\n' => {
                if row < CONSOLE_HEIGHT - 1 {
                    row += 1;
                } else {
                    self.scroll();
                }
                self.set_cursor(row, 0);
            }
            b'\r' => {
                self.set_cursor(row, 0);
            }
            b'\x08' => {
                let (row, col) = if col == 0 {
                    if row == 0 {
                        // Nothing above the first line to delete into.
                        return;
                    }
                    (row - 1, CONSOLE_WIDTH - 1)
                } else {
                    (row, col - 1)
                };
                self.draw_char(row, col, b' ', None);
                self.set_cursor(row, col);
            }
            _ => {
                // Unprintable bytes are dropped so the screen state stays
                // consistent with what the user typed.
                if ch.is_ascii_graphic() || ch == b' ' {
                    self.draw_char(row, col, ch, Some(self.color));
                    self.next_cursor();
                }
            }
        }
    }

    /// Print up to `s.len()` bytes, stopping at an embedded NUL.
    pub fn putbytes(&mut self, s: &[u8]) {
        for &c in s {
            if c == 0 {
                break;
            }
            self.putbyte(c);
        }
    }

    // === Color ===

    fn set_color(&mut self, color: i32) -> bool {
        if !(0..=0xff).contains(&color) {
            return false;
        }
        self.color = color as u8;
        true
    }

    // === Whole screen ===

    fn clear(&mut self) {
        for row in 0..CONSOLE_HEIGHT {
            self.clear_row(row);
        }
        self.row = 0;
        self.col = 0;
        if !self.hidden {
            self.send_curpos();
        }
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.putbytes(s.as_bytes());
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Initialize the console: clear the screen, home the cursor.
pub fn init() {
    let mut con = CONSOLE.lock();
    con.clear();
    con.color = DEFAULT_COLOR;
}

/// Print one byte (driver entry point used by readline echo).
pub fn putbyte(ch: u8) {
    CONSOLE.lock().putbyte(ch);
}

/// Print a byte buffer, stopping at NUL.
pub fn putbytes(s: &[u8]) {
    CONSOLE.lock().putbytes(s);
}

/// Set the output color. Fails on out-of-range values.
pub fn set_term_color(color: i32) -> bool {
    CONSOLE.lock().set_color(color)
}

/// Read back the output color.
pub fn get_term_color() -> i32 {
    i32::from(CONSOLE.lock().color)
}

/// Move the cursor. Fails on out-of-range positions.
pub fn set_cursor(row: i32, col: i32) -> bool {
    if row < 0 || col < 0 {
        return false;
    }
    CONSOLE.lock().set_cursor(row as usize, col as usize)
}

/// Read back the cursor position as (row, col).
pub fn get_cursor() -> (i32, i32) {
    let con = CONSOLE.lock();
    (con.row as i32, con.col as i32)
}

/// Hide the hardware cursor without losing its position.
pub fn hide_cursor() {
    let mut con = CONSOLE.lock();
    con.hidden = true;
    con.send_curpos();
}

/// Show the hardware cursor at its stored position.
pub fn show_cursor() {
    let mut con = CONSOLE.lock();
    con.hidden = false;
    con.send_curpos();
}

/// Clear the whole screen and home the cursor.
pub fn clear_console() {
    CONSOLE.lock().clear();
}

/// Print formatted text to the console.
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Read a character cell back from the screen (test observation point).
#[cfg(test)]
pub fn char_at(row: usize, col: usize) -> u8 {
    (CONSOLE.lock().read_cell(row, col) & 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Console {
        let mut con = Console::new();
        con.clear();
        con
    }

    #[test]
    fn test_putbyte_advances_cursor() {
        let mut con = fresh();
        con.putbyte(b'h');
        con.putbyte(b'i');
        assert_eq!(con.row, 0);
        assert_eq!(con.col, 2);
        assert_eq!(con.read_cell(0, 0) & 0xff, u16::from(b'h'));
        assert_eq!(con.read_cell(0, 1) & 0xff, u16::from(b'i'));
    }

    #[test]
    fn test_newline_and_carriage_return() {
        let mut con = fresh();
        con.putbytes(b"ab\ncd");
        assert_eq!(con.row, 1);
        assert_eq!(con.col, 2);
        con.putbyte(b'\r');
        assert_eq!(con.col, 0);
    }

    #[test]
    fn test_backspace_deletes_previous() {
        let mut con = fresh();
        con.putbytes(b"xy");
        con.putbyte(b'\x08');
        assert_eq!(con.col, 1);
        assert_eq!(con.read_cell(0, 1) & 0xff, u16::from(b' '));
    }

    #[test]
    fn test_backspace_at_origin_is_noop() {
        let mut con = fresh();
        con.putbyte(b'\x08');
        assert_eq!((con.row, con.col), (0, 0));
    }

    #[test]
    fn test_backspace_across_line_wrap() {
        let mut con = fresh();
        con.putbytes(b"a\n");
        con.putbyte(b'\x08');
        assert_eq!(con.row, 0);
        assert_eq!(con.col, CONSOLE_WIDTH - 1);
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut con = fresh();
        con.putbytes(b"top");
        for _ in 0..CONSOLE_HEIGHT {
            con.putbyte(b'\n');
        }
        // "top" scrolled off; the first row now holds later content.
        assert_eq!(con.row, CONSOLE_HEIGHT - 1);
        assert_eq!(con.read_cell(0, 0) & 0xff, u16::from(b' '));
    }

    #[test]
    fn test_putbytes_stops_at_nul() {
        let mut con = fresh();
        con.putbytes(b"ab\0cd");
        assert_eq!(con.col, 2);
    }

    #[test]
    fn test_color_validation() {
        let mut con = fresh();
        assert!(con.set_color(0x1f));
        assert!(!con.set_color(-1));
        assert!(!con.set_color(0x100));
        assert_eq!(con.color, 0x1f);
    }

    #[test]
    fn test_unprintable_dropped() {
        let mut con = fresh();
        con.putbyte(0x01);
        assert_eq!((con.row, con.col), (0, 0));
    }
}
