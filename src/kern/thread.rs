//! Thread management
//!
//! Threads are the unit of execution. Each one owns a kernel stack and
//! belongs to exactly one process, which provides its address space.
//!
//! The scheduler's view of the world is a set of lists:
//!
//! - `running`: every runnable thread. Its head is the thread currently
//!   executing, except inside the context-switch window while the
//!   do-not-switch flag is up.
//! - `sleeping`: threads waiting on the clock, kept sorted by wake tick.
//! - one waiting list per process, for threads suspended in wait.
//!
//! Blocked threads are on no list at all; they are reachable only
//! through the tid hash.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::drivers::timer;
use crate::errors::{KernError, KernResult};
use crate::kern::process::{self, Process};
use crate::kern::{thrhash, thrlist};
use crate::kern::thrlist::{ThreadList, LIST_NONE, LIST_RUNNING, LIST_SLEEPING};
use crate::lock::mutex::KMutex;
use crate::memory;
use crate::panic::kernel_panic;
use crate::types::{Pid, Tid, VAddr};
use crate::vm::PAGE_SIZE;

/// Kernel stack size in pages.
pub const KERNEL_STACK_PAGES: usize = 2;

// ============================================================================
// Thread State
// ============================================================================

/// The states a thread moves through. Each has a matching setter that
/// enforces the list discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThrState {
    /// On the runnable queue (running or ready to).
    Running = 0,
    /// Suspended, on no list; woken only by make_runnable.
    Blocked = 1,
    /// On the sleeping queue until its wake tick.
    Sleeping = 2,
    /// On its process's waiting list, inside wait.
    Waiting = 3,
    /// Not schedulable: newly created or vanished.
    Zombie = 4,
}

impl ThrState {
    fn from_u32(v: u32) -> ThrState {
        match v {
            0 => ThrState::Running,
            1 => ThrState::Blocked,
            2 => ThrState::Sleeping,
            3 => ThrState::Waiting,
            _ => ThrState::Zombie,
        }
    }
}

// ============================================================================
// Registered swexn Handler
// ============================================================================

/// A user-registered software exception handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swexn {
    /// Handler entry point
    pub eip: VAddr,
    /// Exception stack top
    pub esp3: VAddr,
    /// Opaque argument passed through
    pub arg: u32,
}

// ============================================================================
// Thread Control Block
// ============================================================================

/// A thread.
pub struct Thread {
    /// Thread identifier (never reused).
    tid: Tid,
    /// Owning process.
    pid: Pid,

    /// Scheduler state; agrees with the list membership tag.
    state: AtomicU32,
    /// Which list the thread is on (see [`thrlist`]).
    list: AtomicU32,

    /// Kernel stack pointer saved by the last context switch out.
    esp: AtomicUsize,
    /// Top of the kernel stack, programmed into the TSS on dispatch.
    esp0: AtomicUsize,
    /// Base of the kernel stack allocation, for teardown.
    kstack_base: AtomicUsize,
    /// Saved user stack pointer.
    esp3: AtomicU32,

    /// Tick at which a sleeping thread wakes.
    wake: AtomicU32,

    /// Registered user exception handler, if any.
    pub swexn: Mutex<Option<Swexn>>,

    /// Serializes deschedule against make_runnable on this thread.
    pub thread_lock: KMutex,
    /// Stack of held kernel mutexes, released involuntarily on vanish.
    pub acquired: Mutex<Vec<KMutex>>,
}

impl Thread {
    fn new(tid: Tid, pid: Pid, esp0: usize, kstack_base: usize) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            pid,
            state: AtomicU32::new(ThrState::Zombie as u32),
            list: AtomicU32::new(LIST_NONE),
            esp: AtomicUsize::new(usize::MAX),
            esp0: AtomicUsize::new(esp0),
            kstack_base: AtomicUsize::new(kstack_base),
            esp3: AtomicU32::new(0xffff_fffc),
            wake: AtomicU32::new(0),
            swexn: Mutex::new(None),
            thread_lock: KMutex::new(),
            acquired: Mutex::new(Vec::new()),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ThrState {
        ThrState::from_u32(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ThrState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn list_id(&self) -> thrlist::ListId {
        self.list.load(Ordering::Acquire)
    }

    pub fn set_list_id(&self, id: thrlist::ListId) {
        self.list.store(id, Ordering::Release);
    }

    pub fn esp(&self) -> usize {
        self.esp.load(Ordering::Acquire)
    }

    pub fn set_esp(&self, esp: usize) {
        self.esp.store(esp, Ordering::Release);
    }

    pub fn esp0(&self) -> usize {
        self.esp0.load(Ordering::Acquire)
    }

    pub fn esp3(&self) -> u32 {
        self.esp3.load(Ordering::Acquire)
    }

    pub fn set_esp3(&self, esp3: u32) {
        self.esp3.store(esp3, Ordering::Release);
    }

    pub fn wake(&self) -> u32 {
        self.wake.load(Ordering::Acquire)
    }

    pub fn set_wake(&self, wake: u32) {
        self.wake.store(wake, Ordering::Release);
    }

    /// A descriptor with a stack but no process links (unit tests).
    #[cfg(test)]
    pub fn bare_for_tests() -> Arc<Thread> {
        let kstack = memory::alloc_pages(KERNEL_STACK_PAGES) as usize;
        let esp0 = kstack + KERNEL_STACK_PAGES * PAGE_SIZE;
        Thread::new(Tid::next(), Pid(0), esp0, kstack)
    }
}

// ============================================================================
// Scheduler Lists
// ============================================================================

static RUNNING: Once<Mutex<ThreadList>> = Once::new();
static SLEEPING: Once<Mutex<ThreadList>> = Once::new();

/// Pointers to the two distinguished threads.
static IDLE: Mutex<Option<Arc<Thread>>> = Mutex::new(None);
static INIT: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

fn running_list() -> &'static Mutex<ThreadList> {
    RUNNING.call_once(|| Mutex::new(ThreadList::new(LIST_RUNNING)))
}

fn sleeping_list() -> &'static Mutex<ThreadList> {
    SLEEPING.call_once(|| Mutex::new(ThreadList::new(LIST_SLEEPING)))
}

/// Initialize the thread subsystem.
pub fn init() {
    let _ = running_list();
    let _ = sleeping_list();
}

/// Clear all scheduler state (tests only).
#[cfg(test)]
pub fn reset_for_tests() {
    running_list().lock().clear();
    sleeping_list().lock().clear();
    *IDLE.lock() = None;
    *INIT.lock() = None;
    thrhash::reset();
}

// ============================================================================
// State Transitions
// ============================================================================

/// Take a thread off whatever list it is on and mark it zombie. The
/// following insert into the destination gives it its real state.
pub fn unset_state(thread: &Arc<Thread>) -> KernResult<()> {
    let removed = match thread.list_id() {
        LIST_NONE => Ok(false),
        LIST_RUNNING => running_list().lock().remove(thread),
        LIST_SLEEPING => sleeping_list().lock().remove(thread),
        waiting => {
            let pid = Pid(waiting & 0x7fff_ffff);
            match process::get(pid) {
                Some(proc) => proc.waiting.lock().remove(thread),
                None => Err(KernError::NoProcess),
            }
        }
    }?;
    let _ = removed;
    thread.set_state(ThrState::Zombie);
    Ok(())
}

/// Make a thread the currently executing one: head of the runnable
/// queue, its kernel stack in the TSS, its page directory installed.
/// Called on the target side of every context switch.
pub fn set_running(thread: &Arc<Thread>) -> KernResult<()> {
    unset_state(thread)?;
    running_list().lock().add_head(thread)?;
    thread.set_state(ThrState::Running);

    arch::set_esp0(thread.esp0());
    match process::get(thread.pid()) {
        Some(proc) => arch::set_page_directory(proc.pagedir.lock().root()),
        None => return Err(KernError::NoProcess),
    }
    Ok(())
}

/// Queue a thread at the tail of the runnable queue.
pub fn set_runnable(thread: &Arc<Thread>) -> KernResult<()> {
    unset_state(thread)?;
    thread.set_state(ThrState::Running);
    running_list().lock().add_tail(thread)
}

/// Park a thread off every list. Only make_runnable brings it back.
pub fn set_blocked(thread: &Arc<Thread>) -> KernResult<()> {
    unset_state(thread)?;
    thread.set_state(ThrState::Blocked);
    Ok(())
}

/// Put a thread on the sleeping queue for `ticks` timer interrupts.
pub fn set_sleeping(thread: &Arc<Thread>, ticks: u32) -> KernResult<()> {
    unset_state(thread)?;
    thread.set_wake(timer::get_time().wrapping_add(ticks));
    thread.set_state(ThrState::Sleeping);
    sleeping_list().lock().add_sorted(thread)
}

/// Put a thread on its process's waiting list.
pub fn set_waiting(thread: &Arc<Thread>) -> KernResult<()> {
    let proc = process::get(thread.pid()).ok_or(KernError::NoProcess)?;
    unset_state(thread)?;
    thread.set_state(ThrState::Waiting);
    let result = proc.waiting.lock().add_tail(thread);
    result
}

// ============================================================================
// Lookup
// ============================================================================

/// Head of the runnable queue.
pub fn get_running() -> Option<Arc<Thread>> {
    running_list().lock().head()
}

/// The currently executing thread. The runnable queue's head is defined
/// to be it; an empty queue here means the scheduler is broken.
pub fn get_self() -> Arc<Thread> {
    match get_running() {
        Some(t) => t,
        None => kernel_panic("runnable list incoherence"),
    }
}

/// Find any live thread by tid.
pub fn get_thread(tid: Tid) -> Option<Arc<Thread>> {
    thrhash::find(tid)
}

/// The sleeping thread with the earliest wake tick.
pub fn get_sleeping() -> Option<Arc<Thread>> {
    sleeping_list().lock().head()
}

/// Head of a process's waiting list.
pub fn get_waiting(parent: &Arc<Process>) -> Option<Arc<Thread>> {
    parent.waiting.lock().head()
}

/// Number of runnable threads.
pub fn num_runnable() -> usize {
    running_list().lock().size()
}

// ============================================================================
// Idle and Init
// ============================================================================

/// Record the idle thread and sever it from the process family so that
/// nobody ever waits on it.
pub fn set_idle(thread: &Arc<Thread>) -> KernResult<()> {
    *IDLE.lock() = Some(Arc::clone(thread));

    let proc = process::get(thread.pid()).ok_or(KernError::NoProcess)?;
    proc.set_original_tid(None);
    if let Some(parent) = proc.take_parent() {
        if let Some(parent) = process::get(parent) {
            parent.forget_child(proc.pid());
        }
    }
    Ok(())
}

/// Record the init thread, the adopter of orphans.
pub fn set_init(thread: &Arc<Thread>) -> KernResult<()> {
    *INIT.lock() = Some(Arc::clone(thread));
    Ok(())
}

/// The idle thread, once registered.
pub fn idle() -> Option<Arc<Thread>> {
    IDLE.lock().clone()
}

/// The init thread, once registered.
pub fn init_thread() -> Option<Arc<Thread>> {
    INIT.lock().clone()
}

/// Is this the idle thread?
pub fn is_idle(thread: &Arc<Thread>) -> bool {
    IDLE.lock().as_ref().is_some_and(|i| i.tid() == thread.tid())
}

// ============================================================================
// Creation and Teardown
// ============================================================================

/// Create a thread inside `parent`. The new thread is a zombie until a
/// setter schedules it.
pub fn create_thread(parent: &Arc<Process>) -> KernResult<Arc<Thread>> {
    let kstack = memory::alloc_pages(KERNEL_STACK_PAGES);
    if kstack.is_null() {
        return Err(KernError::MallocFail);
    }
    let kstack = kstack as usize;
    let esp0 = kstack + KERNEL_STACK_PAGES * PAGE_SIZE;

    let thread = Thread::new(Tid::next(), parent.pid(), esp0, kstack);
    parent.adopt_thread(thread.tid());
    thrhash::add(&thread);
    Ok(thread)
}

/// Clone `target` into `process`. The swexn registration transfers only
/// when `inherit_handler` is set (fork yes, thread_fork no).
pub fn copy_thread(
    process: &Arc<Process>,
    target: &Arc<Thread>,
    inherit_handler: bool,
) -> KernResult<Arc<Thread>> {
    let thread = create_thread(process)?;
    thread.set_esp(target.esp());
    thread.set_esp3(target.esp3());
    if inherit_handler {
        *thread.swexn.lock() = *target.swexn.lock();
    }
    Ok(thread)
}

/// Vanish the calling thread: release every mutex it still holds, drop
/// it from its list and from the process's live count. The descriptor
/// and kernel stack stay around until a wait reaps the process.
pub fn vanish_thread() -> KernResult<()> {
    let me = get_self();

    // Involuntary release, in reverse acquisition order.
    loop {
        let top = me.acquired.lock().last().cloned();
        match top {
            Some(m) => m.unlock(),
            None => break,
        }
    }

    unset_state(&me)?;

    let proc = process::get(me.pid()).ok_or(KernError::NoProcess)?;
    proc.thread_vanished();
    Ok(())
}

/// Free a vanished thread's resources. Runs on some other thread's
/// stack (wait), never on the dying thread's own.
pub fn destroy_thread(thread: &Arc<Thread>) -> KernResult<()> {
    if let Some(proc) = process::get(thread.pid()) {
        proc.forget_thread(thread.tid());
    }

    let kstack = thread.kstack_base.swap(0, Ordering::AcqRel);
    if kstack != 0 {
        // SAFETY: allocated in create_thread with the same page count;
        // the thread no longer runs, so the stack is dead.
        unsafe {
            memory::free_pages(kstack as *mut u8, KERNEL_STACK_PAGES);
        }
    }

    thrhash::remove(thread);
    Ok(())
}
