//! Page directories and page tables
//!
//! Each process owns one [`PageDirectory`]. Kernel space is direct-mapped
//! into every directory with global, supervisor-only entries; user pages
//! are created one at a time against the frame pool. The page-fault
//! handler repairs ZFOD and COW faults and hands everything else to the
//! exception delivery path.
//!
//! Page tables live in kernel heap pages owned by their directory, so a
//! directory can be built, copied and torn down without touching the
//! MMU; installing one is the dispatcher's job.

use alloc::boxed::Box;

use crate::arch;
use crate::errors::{KernError, KernResult};
use crate::kern::exception::{self, Cause};
use crate::kern::{process, thread};
use crate::panic::kernel_panic;
use crate::types::{PAddr, VAddr};
use crate::vm::{
    self, frame, pe, usermem, MemType, KERNEL_PDES, PAGE_SIZE, PAGE_TABLE_ENTRIES,
    USER_MEM_START, ZERO_FRAME,
};

// ============================================================================
// Page Table
// ============================================================================

/// One page table: 1024 PTE words covering 4 MiB.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u32; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    fn new_zeroed() -> Box<PageTable> {
        Box::new(PageTable {
            entries: [0; PAGE_TABLE_ENTRIES],
        })
    }
}

// ============================================================================
// Page Directory
// ============================================================================

/// A process's address space root: 1024 PDE words plus the owned page
/// tables they refer to.
pub struct PageDirectory {
    pdes: PdeArray,
    tables: [Option<Box<PageTable>>; PAGE_TABLE_ENTRIES],
}

#[repr(C, align(4096))]
struct PdeArray([u32; PAGE_TABLE_ENTRIES]);

impl PageDirectory {
    /// Build a directory with kernel space direct-mapped and no user
    /// pages. The zero frame's kernel mapping is made read-only.
    pub fn new_kernel() -> KernResult<PageDirectory> {
        let mut dir = PageDirectory {
            pdes: PdeArray([0; PAGE_TABLE_ENTRIES]),
            tables: core::array::from_fn(|_| None),
        };

        for i in 0..KERNEL_PDES {
            let mut table = PageTable::new_zeroed();
            for (j, entry) in table.entries.iter_mut().enumerate() {
                let pa = ((i * PAGE_TABLE_ENTRIES + j) * PAGE_SIZE) as u32;
                let mut pte = 0u32;
                pte = pe::set(pte, pe::PRESENT);
                pte = pe::set(pte, pe::READWRITE);
                pte = pe::set(pte, pe::GLOBAL);
                pte = pe::with_addr(pte, pa);
                if pa == ZERO_FRAME {
                    // The shared zero frame is never writable.
                    pte = pe::unset(pte, pe::READWRITE);
                }
                *entry = pte;
            }

            let mut pde = 0u32;
            pde = pe::set(pde, pe::PRESENT);
            pde = pe::set(pde, pe::READWRITE);
            pde = pe::set(pde, pe::KERNEL_TABLE);
            dir.pdes.0[i] = pde;
            dir.tables[i] = Some(table);
        }

        Ok(dir)
    }

    /// The root address handed to the dispatcher for cr3.
    pub fn root(&self) -> usize {
        self.pdes.0.as_ptr() as usize
    }

    /// Read the PDE word covering `va`.
    pub fn pde(&self, va: VAddr) -> u32 {
        self.pdes.0[vm::pde_offset(va)]
    }

    /// Read the PTE covering `va`, if its page table exists.
    pub fn pte(&self, va: VAddr) -> Option<u32> {
        let pdi = vm::pde_offset(va);
        if !pe::has(self.pdes.0[pdi], pe::PRESENT) {
            return None;
        }
        self.tables[pdi]
            .as_ref()
            .map(|t| t.entries[vm::pte_offset(va)])
    }

    /// Overwrite the PTE covering `va`. The page table must exist.
    pub fn set_pte(&mut self, va: VAddr, pte: u32) {
        let pdi = vm::pde_offset(va);
        match self.tables[pdi].as_mut() {
            Some(t) => t.entries[vm::pte_offset(va)] = pte,
            None => kernel_panic("set_pte without a page table"),
        }
    }

    /// Make sure a user page table covers `va`, allocating one if needed.
    fn ensure_table(&mut self, va: VAddr) -> KernResult<()> {
        let pdi = vm::pde_offset(va);
        if self.tables[pdi].is_none() {
            self.tables[pdi] = Some(PageTable::new_zeroed());
            let mut pde = 0u32;
            pde = pe::set(pde, pe::PRESENT);
            pde = pe::set(pde, pe::READWRITE);
            pde = pe::set(pde, pe::USER);
            self.pdes.0[pdi] = pde;
        }
        Ok(())
    }
}

// ============================================================================
// Page Creation and Teardown
// ============================================================================

/// Map one user page at `va`.
///
/// - `MemType::Bss` ignores `ref_frame` and maps the shared zero frame
///   with ZFOD set; the first write upgrades it.
/// - A supplied `ref_frame` is mapped copy-on-write (writable cleared).
/// - Otherwise a fresh frame is allocated.
///
/// Writable segment types get the writable bit; text and rodata stay
/// read-only.
pub fn create_page(
    dir: &mut PageDirectory,
    va: VAddr,
    mem_type: MemType,
    ref_frame: Option<PAddr>,
) -> KernResult<()> {
    if va as usize % PAGE_SIZE != 0 || va < USER_MEM_START {
        return Err(KernError::InvalidArg);
    }
    if let Some(rf) = ref_frame {
        if rf as usize % PAGE_SIZE != 0 || rf < USER_MEM_START {
            return Err(KernError::InvalidArg);
        }
    }

    // Allocate up front so a later failure is easy to revert.
    let new_frame = if mem_type != MemType::Bss && ref_frame.is_none() {
        Some(frame::allocate()?)
    } else {
        None
    };

    let free_new = |nf: Option<PAddr>| {
        if let Some(f) = nf {
            if frame::free(f).is_err() {
                kernel_panic("could not free a freshly allocated frame");
            }
        }
    };

    if dir.ensure_table(va).is_err() {
        free_new(new_frame);
        return Err(KernError::MallocFail);
    }

    if let Some(pte) = dir.pte(va) {
        if pe::has(pte, pe::PRESENT) {
            free_new(new_frame);
            return Err(KernError::PageAlreadyPresent);
        }
    }

    let mut pte = 0u32;
    pte = pe::set(pte, pe::PRESENT);
    pte = pe::set(pte, pe::USER);
    if mem_type == MemType::Bss {
        pte = pe::set(pte, pe::ZFOD);
        pte = pe::with_addr(pte, ZERO_FRAME);
    } else if let Some(rf) = ref_frame {
        pte = pe::set(pte, pe::COW);
        pte = pe::with_addr(pte, rf);
    } else {
        pte = pe::with_addr(pte, new_frame.unwrap_or(0));
    }

    // ZFOD and COW mappings must fault on the first write, so only a
    // directly backed writable type gets the writable bit now.
    if mem_type.writable() && !pe::has(pte, pe::ZFOD) && !pe::has(pte, pe::COW) {
        pte = pe::set(pte, pe::READWRITE);
    }

    dir.set_pte(va, pte);
    Ok(())
}

/// Unmap one user page and release its frame. Zero-frame mappings are
/// dropped without touching the allocator.
pub fn destroy_page(dir: &mut PageDirectory, va: VAddr) -> KernResult<()> {
    if va as usize % PAGE_SIZE != 0 {
        return Err(KernError::InvalidArg);
    }

    let pte = dir.pte(va).ok_or(KernError::DirectoryNotPresent)?;
    if !pe::has(pte, pe::PRESENT) {
        return Err(KernError::PageNotPresent);
    }
    if pe::has(pte, pe::GLOBAL) || !pe::has(pte, pe::USER) {
        return Err(KernError::KernelPage);
    }

    let pa = pe::addr(pte);
    dir.set_pte(va, 0);
    arch::flush_tlb();

    if !pe::has(pte, pe::ZFOD) && vm::frame_id(pa).is_some() {
        if frame::free(pa).is_err() {
            kernel_panic("frame allocator coherence error");
        }
    }
    Ok(())
}

/// Release every user PTE in the directory, leaving kernel space alone.
/// Used by exec to wipe the caller's address space before loading.
pub fn reset_paging(dir: &mut PageDirectory) {
    for pdi in 0..PAGE_TABLE_ENTRIES {
        let pde = dir.pdes.0[pdi];
        if !pe::has(pde, pe::PRESENT) || pe::has(pde, pe::KERNEL_TABLE) {
            continue;
        }
        if let Some(table) = dir.tables[pdi].as_mut() {
            for entry in table.entries.iter_mut() {
                let pte = *entry;
                if !pe::has(pte, pe::PRESENT) || pe::has(pte, pe::GLOBAL) {
                    continue;
                }
                if !pe::has(pte, pe::USER) {
                    continue;
                }
                if !pe::has(pte, pe::ZFOD) {
                    if frame::free(pe::addr(pte)).is_err() {
                        kernel_panic("frame allocator coherence error");
                    }
                }
                *entry = 0;
            }
        }
        dir.pdes.0[pdi] = 0;
        dir.tables[pdi] = None;
    }
    arch::flush_tlb();
}

/// Tear down a directory completely, releasing every user frame. The
/// kernel tables are dropped with the directory.
pub fn destroy_paging(dir: &mut PageDirectory) {
    for pdi in 0..PAGE_TABLE_ENTRIES {
        if !pe::has(dir.pdes.0[pdi], pe::PRESENT) {
            continue;
        }
        if let Some(table) = dir.tables[pdi].as_mut() {
            for entry in table.entries.iter_mut() {
                let pte = *entry;
                if pe::has(pte, pe::ZFOD) {
                    continue;
                }
                if !pe::has(pte, pe::PRESENT) || pe::has(pte, pe::GLOBAL) {
                    continue;
                }
                if !pe::has(pte, pe::USER) {
                    continue;
                }
                *entry = 0;
                let err = frame::free(pe::addr(pte));
                if let Err(e) = err {
                    if e != KernError::KernelFrame {
                        kernel_panic("frame allocator coherence error");
                    }
                }
            }
        }
        dir.pdes.0[pdi] = 0;
        dir.tables[pdi] = None;
    }
}

// ============================================================================
// Fork Support
// ============================================================================

/// Mirror the parent's user space into the child, sharing frames
/// copy-on-write.
///
/// For each user-present PTE the child gets a copy and the frame an
/// extra reference. Writable pages have the writable bit cleared and the
/// COW bit set on both sides; read-only pages need no flip. A frame
/// whose count is saturated is eagerly copied through the kernel bounce
/// path instead. On any hard failure the child's paging is destroyed and
/// the error propagates; partially flipped parent bits are harmless (the
/// next fault sees a count of one and upgrades).
pub fn copy_paging(parent: &mut PageDirectory, child: &mut PageDirectory) -> KernResult<()> {
    for pdi in 0..PAGE_TABLE_ENTRIES {
        let pde = parent.pdes.0[pdi];
        if !pe::has(pde, pe::PRESENT) || !pe::has(pde, pe::USER) {
            continue;
        }

        // First use of this 4 MiB range: give the child a table.
        child.tables[pdi] = Some(PageTable::new_zeroed());
        let mut cpde = 0u32;
        cpde = pe::set(cpde, pe::PRESENT);
        cpde = pe::set(cpde, pe::READWRITE);
        cpde = pe::set(cpde, pe::USER);
        child.pdes.0[pdi] = cpde;

        for pti in 0..PAGE_TABLE_ENTRIES {
            let ppte = parent.tables[pdi]
                .as_ref()
                .map(|t| t.entries[pti])
                .unwrap_or(0);
            if !pe::has(ppte, pe::PRESENT) || !pe::has(ppte, pe::USER) {
                continue;
            }

            let va = ((pdi as u32) << 22) | ((pti as u32) << 12);
            let pa = pe::addr(ppte);

            match frame::get(pa) {
                Ok(()) => {
                    let mut cpte = ppte;
                    if pe::has(ppte, pe::READWRITE) {
                        // Both sides fault before their next write.
                        cpte = pe::set(cpte, pe::COW);
                        cpte = pe::unset(cpte, pe::READWRITE);
                        let mut p = ppte;
                        p = pe::set(p, pe::COW);
                        p = pe::unset(p, pe::READWRITE);
                        parent.tables[pdi].as_mut().unwrap().entries[pti] = p;
                    }
                    child.tables[pdi].as_mut().unwrap().entries[pti] = cpte;
                }
                Err(KernError::KernelFrame) => {
                    // Zero-frame (ZFOD) entries are shared without a
                    // count; copy the PTE verbatim.
                    child.tables[pdi].as_mut().unwrap().entries[pti] = ppte;
                }
                Err(KernError::TooManyFrameOwners) => {
                    if let Err(e) = eager_copy(parent, child, pdi, pti, va, pa) {
                        destroy_paging(child);
                        return Err(e);
                    }
                }
                Err(e) => {
                    destroy_paging(child);
                    return Err(e);
                }
            }
        }
    }

    arch::flush_tlb();
    Ok(())
}

/// Saturated-count fallback: give the child a private frame now.
///
/// The bytes travel through a kernel buffer: the parent's PTE is briefly
/// repointed at the new frame so the same virtual address can be used
/// for both sides of the copy, then restored.
fn eager_copy(
    parent: &mut PageDirectory,
    child: &mut PageDirectory,
    pdi: usize,
    pti: usize,
    va: VAddr,
    old_pa: PAddr,
) -> KernResult<()> {
    let pa = frame::allocate()?;

    let mut cpte = 0u32;
    cpte = pe::set(cpte, pe::PRESENT);
    cpte = pe::set(cpte, pe::READWRITE);
    cpte = pe::set(cpte, pe::USER);
    cpte = pe::with_addr(cpte, pa);
    child.tables[pdi].as_mut().unwrap().entries[pti] = cpte;

    let mut buf = alloc::vec![0u8; PAGE_SIZE];
    usermem::read_bytes(parent, va, &mut buf);

    let ppte = parent.tables[pdi].as_ref().unwrap().entries[pti];
    parent.tables[pdi].as_mut().unwrap().entries[pti] = pe::with_addr(ppte, pa);
    arch::flush_tlb();
    usermem::write_bytes(parent, va, &buf);
    parent.tables[pdi].as_mut().unwrap().entries[pti] = pe::with_addr(ppte, old_pa);
    arch::flush_tlb();

    Ok(())
}

// ============================================================================
// Page Fault Handling
// ============================================================================

/// Install the paging machinery once per boot: sizes the frame pool and
/// zeroes the shared zero frame.
pub fn install_paging(upper_mem_kb: u32) {
    frame::init(upper_mem_kb);
    #[cfg(all(target_arch = "x86", not(test)))]
    // SAFETY: boot reserves the zero frame; nothing maps it writable.
    unsafe {
        core::ptr::write_bytes(ZERO_FRAME as usize as *mut u8, 0, PAGE_SIZE);
    }
}

/// The page-fault policy, in order:
///
/// 1. ZFOD entry: allocate a frame, upgrade the mapping to writable,
///    zero the page, resume. Allocation failure falls through.
/// 2. COW entry: clear COW, set writable, duplicate the frame if shared,
///    resume.
/// 3. Anything else: deliver to the thread's swexn handler, or kill the
///    thread.
pub fn page_fault_handler() {
    let addr = arch::get_cr2();
    let page_va = vm::page_addr(addr);

    let me = thread::get_self();
    let proc = match process::get(me.pid()) {
        Some(p) => p,
        None => kernel_panic("page fault without a process"),
    };

    {
        let mut dir = proc.pagedir.lock();
        if let Some(pte) = dir.pte(addr) {
            if pe::has(pte, pe::ZFOD) {
                if let Ok(fr) = frame::allocate() {
                    let mut up = pte;
                    up = pe::unset(up, pe::ZFOD);
                    up = pe::set(up, pe::READWRITE);
                    up = pe::with_addr(up, fr);
                    dir.set_pte(page_va, up);
                    arch::flush_tlb();
                    usermem::zero_bytes(&dir, page_va, PAGE_SIZE);
                    return;
                }
                // Out of frames: treat as an unrepaired fault below.
            } else if pe::has(pte, pe::COW) {
                let mut up = pte;
                up = pe::unset(up, pe::COW);
                up = pe::set(up, pe::READWRITE);
                dir.set_pte(page_va, up);
                if frame::copy_on_write(&mut dir, page_va).is_err() {
                    kernel_panic("copy on write failed on a shared frame");
                }
                return;
            }
        }
    }

    exception::deliver_or_die(Cause::PageFault, Some(addr));
}
