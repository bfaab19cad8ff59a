//! User memory system calls
//!
//! new_pages and remove_pages, the heap of user space. Regions are
//! tracked in the process's memregion table so removal needs only the
//! base address; a partial allocation failure rolls everything back
//! before the call returns.

use crate::errors::KernError;
use crate::panic::kernel_panic;
use crate::syscall::helper;
use crate::types::VAddr;
use crate::vm::page::{create_page, destroy_page};
use crate::vm::{usermem, MemType, PAGE_SIZE};

/// Most pages one new_pages call may ask for (the count must fit the
/// region table's 12-bit length field).
pub const MAX_REGION_PAGES: u32 = 0xfff;

/// Allocate `len` bytes of fresh, zeroed user memory at `base`.
/// Packet: `{base, len}`.
pub fn sys_new_pages(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => kernel_panic("unregistered thread"),
    };

    let mut dir = proc.pagedir.lock();
    if !helper::check_array(&dir, packet, 2) {
        return KernError::InvalidArg.code();
    }
    let base = usermem::read_u32(&dir, packet);
    let len = usermem::read_u32(&dir, packet + 4) as i32;

    if base as usize % PAGE_SIZE != 0 {
        return KernError::InvalidArg.code();
    }
    if len < 0
        || len as usize % PAGE_SIZE != 0
        || len as u32 > MAX_REGION_PAGES * PAGE_SIZE as u32
    {
        return KernError::InvalidArg.code();
    }

    if proc.memregions.lock().full() {
        return KernError::WornOutNewPages.code();
    }

    let num_pages = len as u32 / PAGE_SIZE as u32;

    for i in 0..num_pages {
        let va = base + i * PAGE_SIZE as u32;
        if let Err(e) = create_page(&mut dir, va, MemType::User, None) {
            // Roll back what this call already mapped.
            for j in 0..i {
                if destroy_page(&mut dir, base + j * PAGE_SIZE as u32).is_err() {
                    kernel_panic("unable to destroy a freshly created page");
                }
            }
            return e.code();
        }
    }

    usermem::zero_bytes(&dir, base, len as usize);
    proc.memregions.lock().register(base, num_pages);
    0
}

/// Free a region previously made by new_pages, identified by its base.
pub fn sys_remove_pages(base: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => kernel_panic("unregistered thread"),
    };

    if base as usize % PAGE_SIZE != 0 {
        return KernError::InvalidArg.code();
    }

    let num_pages = match proc.memregions.lock().find_remove(base as VAddr) {
        Some(n) => n,
        None => return KernError::InvalidArg.code(),
    };

    let mut dir = proc.pagedir.lock();
    for i in 0..num_pages {
        if destroy_page(&mut dir, base + i * PAGE_SIZE as u32).is_err() {
            kernel_panic("memory regions unsafely unallocated");
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::{frame, USER_MEM_START};

    /// Stage a {base, len} packet in mapped user memory.
    fn stage_packet(env: &testutil::TestEnv, base: u32, len: u32) -> u32 {
        let _ = env;
        let proc = helper::current_process().unwrap();
        let pkt_page = USER_MEM_START + 0x6000;
        let mut dir = proc.pagedir.lock();
        if dir.pte(pkt_page).is_none()
            || !crate::vm::pe::has(dir.pte(pkt_page).unwrap(), crate::vm::pe::PRESENT)
        {
            create_page(&mut dir, pkt_page, MemType::User, None).unwrap();
        }
        usermem::write_u32(&dir, pkt_page, base);
        usermem::write_u32(&dir, pkt_page + 4, len);
        pkt_page
    }

    #[test]
    fn test_new_remove_round_trip() {
        let env = testutil::kernel_test_env();
        let (god, _me) = env.boot();

        let before = god.memregions.lock().snapshot();
        let baseline = frame::total_refs();

        let base = USER_MEM_START + 0x0010_0000;
        let pkt = stage_packet(&env, base, 3 * PAGE_SIZE as u32);
        assert_eq!(sys_new_pages(pkt), 0);
        assert_eq!(frame::total_refs(), baseline + 3);

        // The new memory reads back zeroed.
        let dir = god.pagedir.lock();
        assert_eq!(usermem::read_u32(&dir, base + 8), 0);
        drop(dir);

        assert_eq!(sys_remove_pages(base), 0);
        assert_eq!(frame::total_refs(), baseline);
        // The region table is byte-identical to before.
        assert_eq!(god.memregions.lock().snapshot(), before);
    }

    #[test]
    fn test_new_pages_validates() {
        let env = testutil::kernel_test_env();
        env.boot();

        let base = USER_MEM_START + 0x0010_0000;
        // Misaligned base.
        let pkt = stage_packet(&env, base + 12, PAGE_SIZE as u32);
        assert_eq!(sys_new_pages(pkt), KernError::InvalidArg.code());
        // Misaligned length.
        let pkt = stage_packet(&env, base, 100);
        assert_eq!(sys_new_pages(pkt), KernError::InvalidArg.code());
        // Oversized region.
        let pkt = stage_packet(&env, base, (MAX_REGION_PAGES + 1) * PAGE_SIZE as u32);
        assert_eq!(sys_new_pages(pkt), KernError::InvalidArg.code());
    }

    #[test]
    fn test_new_pages_rejects_overlap_and_rolls_back() {
        let env = testutil::kernel_test_env();
        let (_god, _me) = env.boot();
        let baseline = frame::total_refs();

        let base = USER_MEM_START + 0x0010_0000;
        let pkt = stage_packet(&env, base, 2 * PAGE_SIZE as u32);
        assert_eq!(sys_new_pages(pkt), 0);

        // A second region overlapping the first fails midway and rolls
        // back completely.
        let overlap = base - PAGE_SIZE as u32;
        let pkt = stage_packet(&env, overlap, 3 * PAGE_SIZE as u32);
        assert_eq!(sys_new_pages(pkt), KernError::PageAlreadyPresent.code());
        assert_eq!(frame::total_refs(), baseline + 2 + 1); // packet page + region

        assert_eq!(sys_remove_pages(base), 0);
    }

    #[test]
    fn test_remove_pages_unknown_base() {
        let env = testutil::kernel_test_env();
        env.boot();
        assert_eq!(
            sys_remove_pages(USER_MEM_START + 0x0020_0000),
            KernError::InvalidArg.code()
        );
    }
}
