//! Raw access to user memory
//!
//! The paging, exec and syscall layers move bytes to and from user
//! addresses: loading segments, staging argv, zeroing fresh pages,
//! building swexn frames. On a real x86 build a user virtual address is
//! just an address (the faulting cases are excluded by prior
//! validation). On every other build, accesses are translated through
//! the given page directory and hit a simulated frame store, so the
//! whole VM path can be exercised hosted.
//!
//! Callers validate mappings first; an unmapped access here is a kernel
//! bug.

use crate::types::VAddr;
use crate::vm::page::PageDirectory;
use crate::vm::{page_addr, PAGE_SIZE};

#[cfg(all(target_arch = "x86", not(test)))]
mod raw {
    use super::*;

    pub fn read_bytes(_dir: &PageDirectory, va: VAddr, buf: &mut [u8]) {
        // SAFETY: the caller has validated the range against the page
        // tables; the MMU does the translation.
        unsafe {
            core::ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), buf.len());
        }
    }

    pub fn write_bytes(_dir: &PageDirectory, va: VAddr, buf: &[u8]) {
        // SAFETY: see read_bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), va as *mut u8, buf.len());
        }
    }

    pub fn zero_bytes(_dir: &PageDirectory, va: VAddr, len: usize) {
        // SAFETY: see read_bytes.
        unsafe {
            core::ptr::write_bytes(va as *mut u8, 0, len);
        }
    }
}

#[cfg(not(all(target_arch = "x86", not(test))))]
mod raw {
    use super::*;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use spin::Mutex;

    use crate::panic::kernel_panic;
    use crate::vm::{self, ZERO_FRAME};

    /// Simulated physical memory, one entry per touched user frame.
    /// Frames that were never written read back as zeros.
    static FRAME_MEM: Mutex<BTreeMap<u32, Box<[u8; PAGE_SIZE]>>> = Mutex::new(BTreeMap::new());

    /// Forget all simulated frame contents (test isolation).
    pub fn sim_clear_frames() {
        FRAME_MEM.lock().clear();
    }

    fn translate(dir: &PageDirectory, va: VAddr) -> u32 {
        match dir.pte(page_addr(va)) {
            Some(pte) if vm::pe::has(pte, vm::pe::PRESENT) => vm::pe::addr(pte),
            _ => kernel_panic("user access to an unmapped address"),
        }
    }

    /// Walk the range page by page, calling `f(frame, frame_off, buf_range)`.
    fn for_chunks(
        dir: &PageDirectory,
        va: VAddr,
        len: usize,
        mut f: impl FnMut(u32, usize, usize, usize),
    ) {
        let mut off = 0usize;
        while off < len {
            let cur = va + off as u32;
            let page_off = (cur - page_addr(cur)) as usize;
            let space = (PAGE_SIZE - page_off).min(len - off);
            let frame = translate(dir, cur);
            f(frame, page_off, off, space);
            off += space;
        }
    }

    pub fn read_bytes(dir: &PageDirectory, va: VAddr, buf: &mut [u8]) {
        let len = buf.len();
        for_chunks(dir, va, len, |frame, page_off, buf_off, n| {
            let mem = FRAME_MEM.lock();
            match mem.get(&frame) {
                Some(page) => buf[buf_off..buf_off + n].copy_from_slice(&page[page_off..page_off + n]),
                None => buf[buf_off..buf_off + n].fill(0),
            }
        });
    }

    pub fn write_bytes(dir: &PageDirectory, va: VAddr, buf: &[u8]) {
        let len = buf.len();
        for_chunks(dir, va, len, |frame, page_off, buf_off, n| {
            if frame == ZERO_FRAME {
                kernel_panic("write through a zero-frame mapping");
            }
            let mut mem = FRAME_MEM.lock();
            let page = mem.entry(frame).or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[page_off..page_off + n].copy_from_slice(&buf[buf_off..buf_off + n]);
        });
    }

    pub fn zero_bytes(dir: &PageDirectory, va: VAddr, len: usize) {
        for_chunks(dir, va, len, |frame, page_off, _buf_off, n| {
            if frame == ZERO_FRAME {
                kernel_panic("write through a zero-frame mapping");
            }
            let mut mem = FRAME_MEM.lock();
            let page = mem.entry(frame).or_insert_with(|| Box::new([0; PAGE_SIZE]));
            page[page_off..page_off + n].fill(0);
        });
    }
}

pub use raw::*;

/// Read one little-endian word from user memory.
pub fn read_u32(dir: &PageDirectory, va: VAddr) -> u32 {
    let mut buf = [0u8; 4];
    read_bytes(dir, va, &mut buf);
    u32::from_le_bytes(buf)
}

/// Write one little-endian word to user memory.
pub fn write_u32(dir: &PageDirectory, va: VAddr, value: u32) {
    write_bytes(dir, va, &value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::page::PageDirectory;
    use crate::vm::{frame, MemType, USER_MEM_START};

    #[test]
    fn test_word_round_trip() {
        let _env = testutil::kernel_test_env();
        let mut dir = PageDirectory::new_kernel().unwrap();
        let va = USER_MEM_START + 0x1000;
        crate::vm::page::create_page(&mut dir, va, MemType::User, None).unwrap();

        write_u32(&dir, va + 8, 0xdead_beef);
        assert_eq!(read_u32(&dir, va + 8), 0xdead_beef);
        // Untouched bytes of the frame read back as zeros.
        assert_eq!(read_u32(&dir, va), 0);
        crate::vm::page::destroy_paging(&mut dir);
        let _ = frame::total_refs();
    }

    #[test]
    fn test_cross_page_copy() {
        let _env = testutil::kernel_test_env();
        let mut dir = PageDirectory::new_kernel().unwrap();
        let base = USER_MEM_START + 0x4000;
        crate::vm::page::create_page(&mut dir, base, MemType::User, None).unwrap();
        crate::vm::page::create_page(&mut dir, base + PAGE_SIZE as u32, MemType::User, None)
            .unwrap();

        let data: alloc::vec::Vec<u8> = (0..64u8).collect();
        let straddle = base + PAGE_SIZE as u32 - 32;
        write_bytes(&dir, straddle, &data);
        let mut back = [0u8; 64];
        read_bytes(&dir, straddle, &mut back);
        assert_eq!(&back[..], &data[..]);
        crate::vm::page::destroy_paging(&mut dir);
    }

    #[test]
    fn test_zfod_page_reads_zero() {
        let _env = testutil::kernel_test_env();
        let mut dir = PageDirectory::new_kernel().unwrap();
        let va = USER_MEM_START + 0x7000;
        crate::vm::page::create_page(&mut dir, va, MemType::Bss, None).unwrap();
        assert_eq!(read_u32(&dir, va + 100), 0);
        crate::vm::page::destroy_paging(&mut dir);
    }
}
