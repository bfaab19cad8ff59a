//! Console and keyboard system calls
//!
//! Input and output each sit behind a dedicated kernel mutex: prints do
//! not interleave, and readline owns the keyboard for a whole line so
//! concurrent readers cannot steal each other's characters.

use alloc::vec;
use spin::Once;

use crate::console;
use crate::drivers::keyboard::{self, MAX_LINE_LENGTH};
use crate::errors::KernError;
use crate::lock::mutex::KMutex;
use crate::syscall::helper;
use crate::vm::usermem;

struct DriverLocks {
    /// One reader owns the prompt at a time.
    input: KMutex,
    /// One writer owns the screen at a time.
    output: KMutex,
}

static LOCKS: Once<DriverLocks> = Once::new();

fn locks() -> &'static DriverLocks {
    LOCKS.call_once(|| DriverLocks {
        input: KMutex::new(),
        output: KMutex::new(),
    })
}

/// Create the driver mutexes. Part of syscall installation.
pub fn init_syscall_mutexes() {
    let _ = locks();
}

// ============================================================================
// Input
// ============================================================================

/// Single-character read. Not implemented; readline is the input path.
pub fn sys_getchar() -> i32 {
    crate::println!("getchar: feature not implemented");
    -1
}

/// Read one `\n`-terminated line into `buf`, echoing as the user types.
/// Packet: `{size, buf*}`. Returns the number of characters consumed.
///
/// Echo quirks user programs depend on: every byte is mirrored to the
/// console inside the loop, except a backspace when the line buffer is
/// already empty, which is swallowed without touching the cursor.
pub fn sys_readline(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let (size, buf) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 2) {
            return KernError::InvalidArg.code();
        }
        let size = usermem::read_u32(&dir, packet) as i32;
        let buf = usermem::read_u32(&dir, packet + 4);
        if size < 0 || size as usize > MAX_LINE_LENGTH {
            return KernError::InvalidArg.code();
        }
        if !helper::check_buffer(&dir, buf, size as usize, true) {
            return KernError::InvalidArg.code();
        }
        (size as usize, buf)
    };

    let mut line = vec![0u8; size];

    // We get in queue for the prompt.
    locks().input.lock();

    let mut consumed = 0usize;
    let mut cursor = 0usize;
    let mut done = false;
    while consumed < size && !done {
        let c = keyboard::readchar();
        consumed += 1;

        if c != b'\x08' || cursor != 0 {
            console::putbyte(c);
        }

        match c {
            b'\n' => {
                line[cursor] = c;
                cursor += 1;
                done = true;
            }
            b'\x08' => {
                if cursor > 0 {
                    line[cursor] = 0;
                    cursor -= 1;
                }
            }
            _ => {
                line[cursor] = c;
                cursor += 1;
            }
        }
    }

    locks().input.unlock();

    {
        let dir = proc.pagedir.lock();
        usermem::write_bytes(&dir, buf, &line[..cursor.min(size)]);
    }

    consumed as i32
}

// ============================================================================
// Output
// ============================================================================

/// Print `size` bytes from `buf`. Packet: `{size, buf*}`.
pub fn sys_print(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let bytes = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 2) {
            return KernError::InvalidArg.code();
        }
        let size = usermem::read_u32(&dir, packet) as i32;
        let buf = usermem::read_u32(&dir, packet + 4);
        if size < 0 || !helper::check_buffer(&dir, buf, size as usize, false) {
            return KernError::InvalidArg.code();
        }
        let mut bytes = vec![0u8; size as usize];
        usermem::read_bytes(&dir, buf, &mut bytes);
        bytes
    };

    locks().output.lock();
    console::putbytes(&bytes);
    locks().output.unlock();
    0
}

/// Set the console output color.
pub fn sys_set_term_color(color: i32) -> i32 {
    locks().output.lock();
    let ok = console::set_term_color(color);
    locks().output.unlock();
    if ok {
        0
    } else {
        KernError::InvalidArg.code()
    }
}

/// Report the cursor position. Packet: `{row*, col*}`.
pub fn sys_get_cursor_pos(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let (row_ptr, col_ptr) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 2) {
            return KernError::InvalidArg.code();
        }
        let row_ptr = usermem::read_u32(&dir, packet);
        let col_ptr = usermem::read_u32(&dir, packet + 4);
        if !helper::check_page(&dir, row_ptr, true) || !helper::check_page(&dir, col_ptr, true) {
            return KernError::InvalidArg.code();
        }
        (row_ptr, col_ptr)
    };

    locks().output.lock();
    let (row, col) = console::get_cursor();
    locks().output.unlock();

    let dir = proc.pagedir.lock();
    usermem::write_u32(&dir, row_ptr, row as u32);
    usermem::write_u32(&dir, col_ptr, col as u32);
    0
}

/// Move the cursor. Packet: `{row, col}`.
pub fn sys_set_cursor_pos(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let (row, col) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 2) {
            return KernError::InvalidArg.code();
        }
        (
            usermem::read_u32(&dir, packet) as i32,
            usermem::read_u32(&dir, packet + 4) as i32,
        )
    };

    locks().output.lock();
    let ok = console::set_cursor(row, col);
    locks().output.unlock();
    if ok {
        0
    } else {
        KernError::InvalidArg.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::page::create_page;
    use crate::vm::{MemType, USER_MEM_START};

    fn user_page(env: &testutil::TestEnv) -> u32 {
        let _ = env;
        let proc = helper::current_process().unwrap();
        let va = USER_MEM_START + 0x9000;
        create_page(&mut proc.pagedir.lock(), va, MemType::User, None).unwrap();
        va
    }

    #[test]
    fn test_print_validates_and_writes() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        let page = user_page(&env);

        {
            let dir = god.pagedir.lock();
            usermem::write_bytes(&dir, page + 0x100, b"ok");
            usermem::write_u32(&dir, page, 2);
            usermem::write_u32(&dir, page + 4, page + 0x100);
        }
        crate::console::clear_console();
        assert_eq!(sys_print(page), 0);
        assert_eq!(crate::console::char_at(0, 0), b'o');
        assert_eq!(crate::console::char_at(0, 1), b'k');

        // Unmapped buffer.
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, page + 4, USER_MEM_START + 0x0050_0000);
        }
        assert_eq!(sys_print(page), KernError::InvalidArg.code());
    }

    #[test]
    fn test_cursor_calls_round_trip() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        let page = user_page(&env);

        // set_cursor_pos {5, 7}
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, page, 5);
            usermem::write_u32(&dir, page + 4, 7);
        }
        assert_eq!(sys_set_cursor_pos(page), 0);

        // get_cursor_pos {&row, &col}
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, page, page + 0x40);
            usermem::write_u32(&dir, page + 4, page + 0x44);
        }
        assert_eq!(sys_get_cursor_pos(page), 0);
        let dir = god.pagedir.lock();
        assert_eq!(usermem::read_u32(&dir, page + 0x40), 5);
        assert_eq!(usermem::read_u32(&dir, page + 0x44), 7);
    }

    #[test]
    fn test_set_term_color_validates() {
        let env = testutil::kernel_test_env();
        env.boot();
        assert_eq!(sys_set_term_color(0x2f), 0);
        assert_eq!(sys_set_term_color(0x1234), KernError::InvalidArg.code());
    }

    #[test]
    fn test_readline_consumes_buffered_line() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        keyboard::reset_for_tests();
        let page = user_page(&env);

        // "hi\n" typed ahead of the call.
        keyboard::push_scancode_for_tests(0x23);
        keyboard::push_scancode_for_tests(0x17);
        keyboard::push_scancode_for_tests(0x1c);

        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, page, 64);
            usermem::write_u32(&dir, page + 4, page + 0x200);
        }
        let n = sys_readline(page);
        assert_eq!(n, 3);
        let dir = god.pagedir.lock();
        let mut got = [0u8; 3];
        usermem::read_bytes(&dir, page + 0x200, &mut got);
        assert_eq!(&got, b"hi\n");
    }

    #[test]
    fn test_readline_backspace_edits_line() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();
        keyboard::reset_for_tests();
        let page = user_page(&env);

        // "ab<backspace>c\n" => "ac\n"
        for sc in [0x1eu8, 0x30, 0x0e, 0x2e, 0x1c] {
            keyboard::push_scancode_for_tests(sc);
        }
        {
            let dir = god.pagedir.lock();
            usermem::write_u32(&dir, page, 64);
            usermem::write_u32(&dir, page + 4, page + 0x200);
        }
        let n = sys_readline(page);
        assert_eq!(n, 5);
        let dir = god.pagedir.lock();
        let mut got = [0u8; 3];
        usermem::read_bytes(&dir, page + 0x200, &mut got);
        assert_eq!(&got, b"ac\n");
    }
}
