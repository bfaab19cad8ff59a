//! Physical frame allocator
//!
//! Keeps one byte of reference count per user frame. A frame's count is
//! the number of page-table entries pointing at it across all page
//! directories (the shared zero frame is never counted). Copy-on-write
//! works by letting the count climb on fork and duplicating a frame the
//! first time somebody writes while the count is above one.
//!
//! All state sits behind one kernel mutex; threads queue FIFO for it.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::arch;
use crate::errors::{KernError, KernResult};
use crate::lock::mutex::KMutex;
use crate::panic::kernel_panic;
use crate::types::{PAddr, VAddr};
use crate::vm::page::PageDirectory;
use crate::vm::{self, usermem, LOWER_MEM_SIZE, PAGE_SIZE, USER_MEM_START};

// ============================================================================
// Frame Table
// ============================================================================

/// The allocator's mutable state.
struct FrameTable {
    /// Per-frame reference counts.
    refs: Vec<u8>,
    /// Some frame with a zero count, or -1 when the pool is exhausted.
    next_available: isize,
    /// Kernel-owned page used to shuttle bytes between frames.
    bounce: Box<[u8; PAGE_SIZE]>,
}

impl FrameTable {
    fn new(nb_frames: usize) -> Self {
        FrameTable {
            refs: vec![0; nb_frames],
            next_available: if nb_frames == 0 { -1 } else { 0 },
            bounce: Box::new([0; PAGE_SIZE]),
        }
    }

    /// Bump a frame's count, maintaining `next_available`.
    fn get(&mut self, frame: PAddr) -> KernResult<()> {
        if frame as usize % PAGE_SIZE != 0 {
            return Err(KernError::InvalidArg);
        }
        let id = vm::frame_id(frame).ok_or(KernError::KernelFrame)?;
        if id >= self.refs.len() {
            return Err(KernError::InvalidArg);
        }
        if self.refs[id] == u8::MAX {
            return Err(KernError::TooManyFrameOwners);
        }
        self.refs[id] += 1;

        if id as isize == self.next_available {
            // Scan forward, wrapping once, for a new free frame.
            let n = self.refs.len();
            let mut found = false;
            let mut f = id;
            for _ in 0..n {
                if self.refs[f] == 0 {
                    self.next_available = f as isize;
                    found = true;
                    break;
                }
                f = (f + 1) % n;
            }
            if !found {
                self.next_available = -1;
            }
        }
        Ok(())
    }

    /// Hand out a free frame with its count set to one.
    fn allocate(&mut self) -> KernResult<PAddr> {
        if self.next_available < 0 {
            return Err(KernError::NoFrames);
        }
        let frame = vm::frame_addr(self.next_available as usize);
        if self.get(frame).is_err() {
            kernel_panic("allocate could not take its own free frame");
        }
        Ok(frame)
    }

    /// Drop a reference, maintaining `next_available`.
    fn free(&mut self, frame: PAddr) -> KernResult<()> {
        if frame as usize % PAGE_SIZE != 0 {
            return Err(KernError::InvalidArg);
        }
        let id = vm::frame_id(frame).ok_or(KernError::KernelFrame)?;
        if id >= self.refs.len() {
            return Err(KernError::InvalidArg);
        }
        if self.refs[id] == 0 {
            return Err(KernError::FreeOwnerlessFrame);
        }
        self.refs[id] -= 1;
        if self.refs[id] == 0 && self.next_available == -1 {
            self.next_available = id as isize;
        }
        Ok(())
    }
}

// ============================================================================
// Allocator Singleton
// ============================================================================

/// The frame allocator: one kernel mutex serializing threads, the table
/// cell inside it.
pub struct FrameAllocator {
    mutex: KMutex,
    table: Mutex<FrameTable>,
}

static FRAMES: Once<FrameAllocator> = Once::new();

fn allocator() -> &'static FrameAllocator {
    FRAMES.get().expect("frame allocator not initialized")
}

/// Size the frame pool from the machine's upper memory (in kilobytes).
pub fn init(upper_mem_kb: u32) {
    let bytes = LOWER_MEM_SIZE as u64 + u64::from(upper_mem_kb) * 1024;
    let nb_frames = ((bytes.saturating_sub(u64::from(USER_MEM_START))) / PAGE_SIZE as u64) as usize;
    FRAMES.call_once(|| FrameAllocator {
        mutex: KMutex::new(),
        table: Mutex::new(FrameTable::new(nb_frames)),
    });
}

/// Rebuild the pool with `nb_frames` empty frames (tests only).
#[cfg(test)]
pub fn reset(nb_frames: usize) {
    FRAMES.call_once(|| FrameAllocator {
        mutex: KMutex::new(),
        table: Mutex::new(FrameTable::new(0)),
    });
    *allocator().table.lock() = FrameTable::new(nb_frames);
}

// ============================================================================
// Public Operations
// ============================================================================

/// Allocate a frame for the caller. The returned frame has a reference
/// count of one.
pub fn allocate() -> KernResult<PAddr> {
    let fa = allocator();
    fa.mutex.lock();
    let res = fa.table.lock().allocate();
    fa.mutex.unlock();
    res
}

/// Take an additional reference on a frame (fork sharing a page).
pub fn get(frame: PAddr) -> KernResult<()> {
    let fa = allocator();
    fa.mutex.lock();
    let res = fa.table.lock().get(frame);
    fa.mutex.unlock();
    res
}

/// Release one reference on a frame.
pub fn free(frame: PAddr) -> KernResult<()> {
    let fa = allocator();
    fa.mutex.lock();
    let res = fa.table.lock().free(frame);
    fa.mutex.unlock();
    res
}

/// Give the calling process a private copy of the page at `page_va`.
///
/// If the underlying frame has a single owner this is a no-op; the
/// caller keeps the frame. Otherwise a fresh frame is allocated, the
/// page's bytes travel through the kernel bounce buffer (the virtual
/// address must keep mapping the old frame while it is read), the PTE is
/// repointed, the TLB flushed, and the old frame's count dropped.
pub fn copy_on_write(dir: &mut PageDirectory, page_va: VAddr) -> KernResult<()> {
    if page_va as usize % PAGE_SIZE != 0 {
        return Err(KernError::InvalidArg);
    }

    let pte = match dir.pte(page_va) {
        Some(pte) if vm::pe::has(pte, vm::pe::PRESENT) => pte,
        _ => kernel_panic("copy on write on a non-existing page"),
    };
    let old_frame = vm::pe::addr(pte);
    let old_id = match vm::frame_id(old_frame) {
        Some(id) => id,
        None => kernel_panic("copy on write on a kernel frame"),
    };

    let fa = allocator();
    fa.mutex.lock();
    let mut table = fa.table.lock();

    match table.refs.get(old_id).copied() {
        Some(1) => {
            // Sole owner; the page is ours already.
            drop(table);
            fa.mutex.unlock();
            return Ok(());
        }
        Some(0) | None => {
            drop(table);
            fa.mutex.unlock();
            return Err(KernError::FreeOwnerlessFrame);
        }
        _ => {}
    }

    let new_frame = match table.allocate() {
        Ok(f) => f,
        Err(e) => {
            drop(table);
            fa.mutex.unlock();
            return Err(e);
        }
    };

    // Save the old contents, repoint the PTE, and replay the bytes into
    // the new frame through the same virtual address.
    let mut bounce = core::mem::replace(&mut table.bounce, Box::new([0; PAGE_SIZE]));
    usermem::read_bytes(dir, page_va, &mut bounce[..]);
    let new_pte = vm::pe::with_addr(pte, new_frame);
    dir.set_pte(page_va, new_pte);
    arch::flush_tlb();
    usermem::write_bytes(dir, page_va, &bounce[..]);
    table.bounce = bounce;

    table.refs[old_id] -= 1;
    if table.refs[old_id] == 0 && table.next_available == -1 {
        table.next_available = old_id as isize;
    }

    drop(table);
    fa.mutex.unlock();
    Ok(())
}

// ============================================================================
// Accounting
// ============================================================================

/// Reference count of one frame (diagnostics and tests).
pub fn ref_count(frame: PAddr) -> u8 {
    let fa = allocator();
    let table = fa.table.lock();
    vm::frame_id(frame)
        .and_then(|id| table.refs.get(id).copied())
        .unwrap_or(0)
}

/// Sum of all reference counts (diagnostics and tests).
pub fn total_refs() -> usize {
    let fa = allocator();
    let table = fa.table.lock();
    table.refs.iter().map(|&r| r as usize).sum()
}

/// Number of frames in the pool.
pub fn pool_size() -> usize {
    allocator().table.lock().refs.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;

    #[test]
    fn test_allocate_free_round_trip() {
        let _env = testutil::kernel_test_env();
        let f = allocate().unwrap();
        assert_eq!(ref_count(f), 1);
        free(f).unwrap();
        assert_eq!(ref_count(f), 0);
        assert_eq!(total_refs(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let _env = testutil::kernel_test_env();
        let n = pool_size();
        let mut frames = alloc::vec::Vec::new();
        for _ in 0..n {
            frames.push(allocate().unwrap());
        }
        assert_eq!(allocate().unwrap_err(), KernError::NoFrames);
        // Freeing one frame revives the pool.
        free(frames.pop().unwrap()).unwrap();
        assert!(allocate().is_ok());
    }

    #[test]
    fn test_get_refuses_kernel_frames() {
        let _env = testutil::kernel_test_env();
        assert_eq!(get(0x0000_1000).unwrap_err(), KernError::KernelFrame);
        assert_eq!(free(vm::ZERO_FRAME).unwrap_err(), KernError::KernelFrame);
    }

    #[test]
    fn test_get_saturation() {
        let _env = testutil::kernel_test_env();
        let f = allocate().unwrap();
        for _ in 1..255 {
            get(f).unwrap();
        }
        assert_eq!(ref_count(f), 255);
        assert_eq!(get(f).unwrap_err(), KernError::TooManyFrameOwners);
        for _ in 0..255 {
            free(f).unwrap();
        }
        assert_eq!(free(f).unwrap_err(), KernError::FreeOwnerlessFrame);
    }

    #[test]
    fn test_misaligned_rejected() {
        let _env = testutil::kernel_test_env();
        assert_eq!(get(USER_MEM_START + 12).unwrap_err(), KernError::InvalidArg);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use crate::kern::testutil;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    proptest! {
        /// The sum of all reference counts tracks the live references
        /// exactly, whatever the alloc/get/free interleaving.
        #[test]
        fn prop_refcounts_conserved(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let _env = testutil::kernel_test_env();
            let mut live: Vec<crate::types::PAddr> = Vec::new();
            let mut model = 0usize;

            for op in ops {
                match op {
                    0 => {
                        if let Ok(f) = allocate() {
                            live.push(f);
                            model += 1;
                        }
                    }
                    1 => {
                        if let Some(&f) = live.first() {
                            if get(f).is_ok() {
                                live.push(f);
                                model += 1;
                            }
                        }
                    }
                    _ => {
                        if let Some(f) = live.pop() {
                            free(f).unwrap();
                            model -= 1;
                        }
                    }
                }
                prop_assert_eq!(total_refs(), model);
            }
        }

        /// allocate succeeds exactly while a zero-count frame exists.
        #[test]
        fn prop_exhaustion_boundary(extra in 0usize..8) {
            let _env = testutil::kernel_test_env();
            let n = pool_size();
            let mut held = Vec::new();
            for _ in 0..n {
                held.push(allocate().unwrap());
            }
            for _ in 0..extra {
                prop_assert_eq!(allocate().unwrap_err(), KernError::NoFrames);
            }
            for f in held {
                free(f).unwrap();
            }
            prop_assert_eq!(total_refs(), 0);
        }
    }
}
