//! Process management
//!
//! A process owns an address space (its page directory), a table of
//! new_pages regions, a family position (parent, children) and a set of
//! threads. Processes form a forest rooted at the first process; when a
//! process dies with children, init adopts them.
//!
//! Lifecycle: RUNNING until the last thread vanishes, EXITED until a
//! waiter reaps it, BURIED while being torn down.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::boxed::Box;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::errors::{KernError, KernResult};
use crate::kern::thread;
use crate::kern::thrlist::{waiting_list_id, ThreadList};
use crate::panic::kernel_panic;
use crate::types::{Pid, Tid, VAddr};
use crate::vm::page::{self, PageDirectory};
use crate::vm::{self, MemType, PAGE_TABLE_ENTRIES};

// ============================================================================
// Process State
// ============================================================================

/// The states a process moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcState {
    /// Has live threads (or has not started yet).
    Running = 0,
    /// Every thread vanished; exit status ready for a waiter.
    Exited = 1,
    /// A waiter is tearing it down.
    Buried = 2,
}

impl ProcState {
    fn from_u32(v: u32) -> ProcState {
        match v {
            0 => ProcState::Running,
            1 => ProcState::Exited,
            _ => ProcState::Buried,
        }
    }
}

// ============================================================================
// Memory Region Table
// ============================================================================

/// Bookkeeping for new_pages/remove_pages: each entry packs a
/// page-aligned base with its page count (`base | pages`), so
/// remove_pages can find how much to free from the base alone.
pub struct MemRegions {
    entries: Box<[u32; PAGE_TABLE_ENTRIES]>,
    next_idx: i32,
}

impl MemRegions {
    fn new() -> MemRegions {
        MemRegions {
            entries: Box::new([0; PAGE_TABLE_ENTRIES]),
            next_idx: 0,
        }
    }

    /// Is there a free slot?
    pub fn full(&self) -> bool {
        self.next_idx < 0
    }

    /// Record a region. The caller has checked `full()` first.
    pub fn register(&mut self, base: VAddr, pages: u32) {
        let idx = self.next_idx as usize;
        self.entries[idx] = base | pages;

        // Advance circularly to the next free slot.
        let mut next = (idx + 1) % PAGE_TABLE_ENTRIES;
        while next != idx {
            if self.entries[next] == 0 {
                break;
            }
            next = (next + 1) % PAGE_TABLE_ENTRIES;
        }
        self.next_idx = if next == idx { -1 } else { next as i32 };
    }

    /// Find a region by base, clear its slot and return its page count.
    pub fn find_remove(&mut self, base: VAddr) -> Option<u32> {
        for idx in 0..PAGE_TABLE_ENTRIES {
            if self.entries[idx] & 0xffff_f000 == base && self.entries[idx] != 0 {
                let pages = self.entries[idx] & 0xfff;
                self.entries[idx] = 0;
                if self.next_idx < 0 {
                    self.next_idx = idx as i32;
                }
                return Some(pages);
            }
        }
        None
    }

    /// Byte-for-byte copy of the table (tests).
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<u32> {
        self.entries.to_vec()
    }
}

// ============================================================================
// Process Control Block
// ============================================================================

/// A process.
pub struct Process {
    /// Process identifier (never reused).
    pid: Pid,
    /// Status reported to a waiter; −1 until set_status.
    exit_status: AtomicI32,
    state: AtomicU32,

    /// The address space root.
    pub pagedir: Mutex<PageDirectory>,
    /// new_pages region bookkeeping.
    pub memregions: Mutex<MemRegions>,

    /// Family links. Children are ordered oldest first.
    parent: Mutex<Option<Pid>>,
    children: Mutex<Vec<Pid>>,

    /// Every thread ever created in this process, oldest first, kept
    /// until wait reaps the whole process.
    threads_list: Mutex<Vec<Tid>>,
    /// Threads that have not vanished yet.
    live_threads: AtomicU32,
    /// The first thread's tid, reported by wait.
    original_tid: Mutex<Option<Tid>>,

    /// Threads suspended in wait on this process's children.
    pub waiting: Mutex<ThreadList>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        ProcState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ProcState) {
        self.state.store(s as u32, Ordering::Release);
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    pub fn parent(&self) -> Option<Pid> {
        *self.parent.lock()
    }

    pub fn take_parent(&self) -> Option<Pid> {
        self.parent.lock().take()
    }

    fn set_parent(&self, pid: Option<Pid>) {
        *self.parent.lock() = pid;
    }

    pub fn children_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Drop one child from the family (idle severing, reaping).
    pub fn forget_child(&self, pid: Pid) {
        self.children.lock().retain(|&c| c != pid);
    }

    pub fn original_tid(&self) -> Option<Tid> {
        *self.original_tid.lock()
    }

    pub fn set_original_tid(&self, tid: Option<Tid>) {
        *self.original_tid.lock() = tid;
    }

    /// Threads alive (not yet vanished).
    pub fn live_threads(&self) -> u32 {
        self.live_threads.load(Ordering::Acquire)
    }

    /// Threads ever created and not yet reaped.
    pub fn thread_count(&self) -> usize {
        self.threads_list.lock().len()
    }

    /// Register a new thread of this process.
    pub fn adopt_thread(&self, tid: Tid) {
        let mut threads = self.threads_list.lock();
        let first = threads.is_empty() && self.original_tid.lock().is_none();
        if first {
            *self.original_tid.lock() = Some(tid);
        }
        threads.push(tid);
        self.live_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// A thread of this process vanished.
    pub fn thread_vanished(&self) {
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop a reaped thread from the list.
    pub fn forget_thread(&self, tid: Tid) {
        self.threads_list.lock().retain(|&t| t != tid);
    }

    fn reaped_threads(&self) -> Vec<Tid> {
        self.threads_list.lock().clone()
    }
}

// ============================================================================
// Registry
// ============================================================================

static PROCESSES: Once<Mutex<BTreeMap<u32, Arc<Process>>>> = Once::new();

fn registry() -> &'static Mutex<BTreeMap<u32, Arc<Process>>> {
    PROCESSES.call_once(|| Mutex::new(BTreeMap::new()))
}

/// Look a process up by pid.
pub fn get(pid: Pid) -> Option<Arc<Process>> {
    registry().lock().get(&pid.0).cloned()
}

/// Number of registered processes.
pub fn count() -> usize {
    registry().lock().len()
}

/// Drop every registration (tests only).
#[cfg(test)]
pub fn reset_for_tests() {
    registry().lock().clear();
}

// ============================================================================
// Creation
// ============================================================================

/// Create a fresh process: new pid, kernel-mapped page directory, empty
/// region table and waiting list, no family.
pub fn create_process() -> KernResult<Arc<Process>> {
    let pagedir = PageDirectory::new_kernel()?;
    let pid = Pid::next();

    let process = Arc::new(Process {
        pid,
        exit_status: AtomicI32::new(-1),
        state: AtomicU32::new(ProcState::Running as u32),
        pagedir: Mutex::new(pagedir),
        memregions: Mutex::new(MemRegions::new()),
        parent: Mutex::new(None),
        children: Mutex::new(Vec::new()),
        threads_list: Mutex::new(Vec::new()),
        live_threads: AtomicU32::new(0),
        original_tid: Mutex::new(None),
        waiting: Mutex::new(ThreadList::new(waiting_list_id(pid))),
    });

    registry().lock().insert(pid.0, Arc::clone(&process));
    Ok(process)
}

/// Create the first process. Unlike fork it gets a user stack page made
/// from nothing; its paging is installed so exec can run.
pub fn create_god_process() -> KernResult<Arc<Process>> {
    let god = create_process()?;

    {
        let mut dir = god.pagedir.lock();
        arch::set_page_directory(dir.root());
        arch::enable_paging();
        page::create_page(&mut dir, vm::page_addr(0xffff_fffc), MemType::Stack, None)?;
    }

    Ok(god)
}

/// Fork support: duplicate `parent` into a new process sharing its
/// memory copy-on-write.
pub fn copy_process(parent: &Arc<Process>) -> KernResult<Arc<Process>> {
    let child = create_process()?;

    {
        let mut pdir = parent.pagedir.lock();
        let mut cdir = child.pagedir.lock();
        if let Err(e) = page::copy_paging(&mut pdir, &mut cdir) {
            drop(cdir);
            drop(pdir);
            let _ = destroy_process(&child);
            return Err(e);
        }
    }

    child.set_parent(Some(parent.pid()));
    parent.children.lock().push(child.pid());
    Ok(child)
}

// ============================================================================
// Exit Path
// ============================================================================

/// Youngest child that has already exited, if any.
pub fn exited_child(parent: &Arc<Process>) -> Option<Arc<Process>> {
    let children = parent.children.lock();
    children
        .iter()
        .rev()
        .filter_map(|&pid| get(pid))
        .find(|c| c.state() == ProcState::Exited)
}

/// Mark a fully vanished process EXITED, handing surviving children to
/// init for later collection.
pub fn vanish_process(process: &Arc<Process>) -> KernResult<()> {
    if process.live_threads() > 0 {
        return Err(KernError::ActiveThreads);
    }

    let orphans: Vec<Pid> = core::mem::take(&mut *process.children.lock());
    if !orphans.is_empty() {
        let init_task = match thread::init_thread().and_then(|t| get(t.pid())) {
            Some(p) => p,
            None => kernel_panic("init is nowhere to be found"),
        };
        for &pid in &orphans {
            if let Some(child) = get(pid) {
                child.set_parent(Some(init_task.pid()));
            }
        }
        // The whole batch becomes init's youngest children, keeping
        // their relative ages.
        init_task.children.lock().extend(orphans);
    }

    process.set_state(ProcState::Exited);
    Ok(())
}

/// Reap an exited process: destroy its threads, its address space and
/// its descriptor. Runs on the waiter's stack.
pub fn destroy_process(process: &Arc<Process>) -> KernResult<()> {
    if process.state() == ProcState::Running && process.thread_count() > 0 {
        return Err(KernError::ProcessNotExited);
    }
    process.set_state(ProcState::Buried);

    for tid in process.reaped_threads() {
        if let Some(t) = thread::get_thread(tid) {
            thread::destroy_thread(&t)?;
        } else {
            process.forget_thread(tid);
        }
    }

    // Unlink from the family.
    if let Some(parent) = process.parent() {
        if let Some(parent) = get(parent) {
            parent.forget_child(process.pid());
        }
    }

    page::destroy_paging(&mut process.pagedir.lock());
    registry().lock().remove(&process.pid().0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::testutil;
    use crate::vm::frame;

    #[test]
    fn test_create_process_shape() {
        let _env = testutil::kernel_test_env();
        let p = create_process().unwrap();
        assert_eq!(p.state(), ProcState::Running);
        assert_eq!(p.exit_status(), -1);
        assert_eq!(p.children_count(), 0);
        assert_eq!(p.live_threads(), 0);
        assert!(p.original_tid().is_none());
        assert!(get(p.pid()).is_some());
        destroy_process(&p).unwrap();
        assert!(get(p.pid()).is_none());
    }

    #[test]
    fn test_god_process_gets_user_stack() {
        let _env = testutil::kernel_test_env();
        let god = create_god_process().unwrap();
        let dir = god.pagedir.lock();
        let pte = dir.pte(vm::page_addr(0xffff_fffc)).unwrap();
        assert!(vm::pe::has(pte, vm::pe::PRESENT));
        assert!(vm::pe::has(pte, vm::pe::READWRITE));
        drop(dir);
        // Its directory is the installed one.
        assert_eq!(
            crate::arch::sim_state().page_directory,
            god.pagedir.lock().root()
        );
        destroy_process(&god).unwrap();
        assert_eq!(frame::total_refs(), 0);
    }

    #[test]
    fn test_copy_process_links_family() {
        let _env = testutil::kernel_test_env();
        let parent = create_god_process().unwrap();
        let child = copy_process(&parent).unwrap();

        assert_eq!(child.parent(), Some(parent.pid()));
        assert_eq!(parent.children_count(), 1);
        assert!(parent.pid().0 < child.pid().0);

        destroy_process(&child).unwrap();
        assert_eq!(parent.children_count(), 0);
        destroy_process(&parent).unwrap();
        assert_eq!(frame::total_refs(), 0);
    }

    #[test]
    fn test_exited_child_picks_youngest() {
        let _env = testutil::kernel_test_env();
        let parent = create_god_process().unwrap();
        let a = copy_process(&parent).unwrap();
        let b = copy_process(&parent).unwrap();

        assert!(exited_child(&parent).is_none());
        vanish_process(&a).unwrap();
        vanish_process(&b).unwrap();
        // Youngest exited child wins.
        assert_eq!(exited_child(&parent).unwrap().pid(), b.pid());

        destroy_process(&b).unwrap();
        destroy_process(&a).unwrap();
        destroy_process(&parent).unwrap();
    }

    #[test]
    fn test_memregions_round_trip() {
        let _env = testutil::kernel_test_env();
        let p = create_process().unwrap();
        let mut regions = p.memregions.lock();
        let before = regions.snapshot();

        regions.register(0x0200_0000, 3);
        assert_eq!(regions.find_remove(0x0200_0000), Some(3));
        // Table returns to its exact prior state.
        assert_eq!(regions.snapshot(), before);
        assert_eq!(regions.find_remove(0x0200_0000), None);
        drop(regions);
        destroy_process(&p).unwrap();
    }

    #[test]
    fn test_memregions_fill_and_recover() {
        let _env = testutil::kernel_test_env();
        let mut r = MemRegions::new();
        for i in 0..PAGE_TABLE_ENTRIES {
            assert!(!r.full());
            r.register(0x0200_0000 + (i as u32) * 0x1000, 1);
        }
        assert!(r.full());
        assert_eq!(r.find_remove(0x0200_0000), Some(1));
        assert!(!r.full());
    }
}
