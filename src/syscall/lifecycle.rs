//! Process lifecycle system calls
//!
//! fork, thread_fork, exec, set_status, wait and vanish: the whole arc
//! from duplication through execution to collection.

use alloc::string::String;
use alloc::vec::Vec;

#[cfg(test)]
use alloc::sync::Arc;

use crate::drivers::timer::dont_switch_me_out;
use crate::errors::{to_syscall_ret, KernError, KernResult};
use crate::kern::context::{self, child_stack};
use crate::kern::process;
use crate::kern::thread;
#[cfg(test)]
use crate::kern::thread::Thread;
use crate::panic::kernel_panic;
use crate::syscall::helper;
use crate::types::VAddr;
use crate::vm::page::{create_page, reset_paging, PageDirectory};
use crate::vm::{self, usermem, MemType, PAGE_SIZE};
use crate::{loader, ramdisk};

// ============================================================================
// fork / thread_fork
// ============================================================================

/// Duplicate the calling process. The child shares every page
/// copy-on-write and starts with a single thread whose kernel stack is
/// handcrafted to return 0 from this very system call.
pub fn fork() -> KernResult<i32> {
    let me = thread::get_self();
    let proc = helper::current_process().ok_or(KernError::NoProcess)?;

    // A multithreaded fork would duplicate one thread's stack and lose
    // the rest; refuse it outright.
    if proc.live_threads() > 1 {
        return Err(KernError::MultipleThreads);
    }

    let child = process::copy_process(&proc)?;

    let new = match thread::copy_thread(&child, &me, true) {
        Ok(t) => t,
        Err(_) => {
            let _ = process::destroy_process(&child);
            return Err(KernError::CopyThreadFail);
        }
    };

    if let Err(e) = thread::set_runnable(&new) {
        let _ = thread::destroy_thread(&new);
        let _ = process::destroy_process(&child);
        return Err(e);
    }

    // The child wakes inside the trap wrapper with a zero return.
    child_stack(&new, me.esp0());

    Ok(new.tid().0 as i32)
}

pub fn sys_fork() -> i32 {
    to_syscall_ret(fork())
}

/// Add a thread to the calling process. Like fork but with a shared
/// address space and no swexn inheritance.
pub fn thread_fork() -> KernResult<i32> {
    let me = thread::get_self();
    let proc = helper::current_process().ok_or(KernError::NoProcess)?;

    let new = thread::copy_thread(&proc, &me, false).map_err(|_| KernError::CopyThreadFail)?;
    thread::set_runnable(&new)?;
    child_stack(&new, me.esp0());

    Ok(new.tid().0 as i32)
}

pub fn sys_thread_fork() -> i32 {
    to_syscall_ret(thread_fork())
}

// ============================================================================
// set_status
// ============================================================================

/// Record the exit status a future waiter will collect.
pub fn sys_set_status(status: i32) {
    match helper::current_process() {
        Some(proc) => proc.set_exit_status(status),
        None => kernel_panic("set_status without a process"),
    }
}

// ============================================================================
// exec
// ============================================================================

/// Segment descriptors the load loop walks, in load order.
struct Segment {
    mem_type: MemType,
    start: VAddr,
    len: usize,
    file_off: usize,
}

/// Replace the calling process's address space with a fresh image.
///
/// The argv strings are staged into kernel storage first (the paging
/// reset destroys their user pages), replayed into read-only pages
/// above the new user stack, and the `argc/argv/stack` frame is pushed
/// below them. The names `idle` and `init` register the corresponding
/// threads on the way through. Does not return on success: the thread
/// launches into the new image.
pub fn do_exec(execname: &str, args: &[String]) -> KernResult<i32> {
    let me = thread::get_self();
    let proc = helper::current_process().ok_or(KernError::NoProcess)?;

    let is_idle = execname == "idle";
    let is_init = execname == "init";

    let entry = ramdisk::entry(execname).ok_or(KernError::ElfInvalid)?;
    loader::elf_check_header(entry.bytes)?;
    let hdr = loader::elf_load_helper(entry.bytes)?;

    // Stage the strings, youngest first, so the replay below walks them
    // in reverse.
    let num_args = args.len();
    let karg: Vec<Vec<u8>> = args
        .iter()
        .rev()
        .map(|a| {
            let mut v = a.as_bytes().to_vec();
            v.push(0);
            v
        })
        .collect();
    let total_len: usize = karg.iter().map(Vec::len).sum();

    let mut dir = proc.pagedir.lock();

    // From here on the old image is gone; failures leave an address
    // space with nothing user-visible mapped.
    reset_paging(&mut dir);

    // Read-only pages above the stack hold the argv strings.
    let top_page: VAddr = 0xffff_f000;
    let num_arg_pages = total_len.div_ceil(PAGE_SIZE);
    let mut va = top_page;
    for i in 0..num_arg_pages {
        if i > 0 {
            va -= PAGE_SIZE as u32;
        }
        if create_page(&mut dir, va, MemType::Rodata, None).is_err() {
            return Err(KernError::SaveArgsFail);
        }
    }
    let bottom_argzone = va;

    // The user stack page right below the argument zone.
    let esp3: VAddr = bottom_argzone - 4;
    if create_page(&mut dir, vm::page_addr(esp3), MemType::Stack, None).is_err() {
        return Err(KernError::CreateUserStackFail);
    }

    // Replay the strings and the pointer vector.
    let mut cursor = bottom_argzone;
    for (i, arg) in karg.iter().enumerate() {
        usermem::write_bytes(&dir, cursor, arg);
        usermem::write_u32(&dir, esp3 - (i * 4) as u32, cursor);
        cursor += arg.len() as u32;
    }

    // argc / argv / stack_high / stack_low under the pointers.
    let argbase = esp3 - ((num_args + 4) * 4) as u32;
    usermem::write_u32(&dir, argbase + 16, vm::page_addr(esp3));
    usermem::write_u32(&dir, argbase + 12, esp3);
    usermem::write_u32(&dir, argbase + 8, argbase + 20);
    usermem::write_u32(&dir, argbase + 4, num_args as u32);
    me.set_esp3(argbase);

    // Map and fill the four segments.
    let segments = [
        Segment {
            mem_type: MemType::Text,
            start: hdr.txt_start,
            len: hdr.txt_len,
            file_off: hdr.txt_off,
        },
        Segment {
            mem_type: MemType::Data,
            start: hdr.dat_start,
            len: hdr.dat_len,
            file_off: hdr.dat_off,
        },
        Segment {
            mem_type: MemType::Rodata,
            start: hdr.rodat_start,
            len: hdr.rodat_len,
            file_off: hdr.rodat_off,
        },
        Segment {
            mem_type: MemType::Bss,
            start: hdr.bss_start,
            len: hdr.bss_len,
            file_off: 0,
        },
    ];

    for seg in &segments {
        load_segment(&mut dir, seg, &hdr, entry.bytes)?;
    }

    // The distinguished programs register themselves as they start.
    if is_idle && thread::set_idle(&me).is_err() {
        kernel_panic("no idle thread");
    }
    if is_init && thread::set_init(&me).is_err() {
        kernel_panic("no init thread");
    }

    drop(dir);
    context::launch(hdr.entry, me.esp3());
    Ok(0)
}

/// Does `page` fall inside the page range another segment occupies?
fn page_within(page: VAddr, start: VAddr, len: usize) -> bool {
    len > 0 && page >= vm::page_addr(start) && page <= vm::page_addr(start + len as u32)
}

fn load_segment(
    dir: &mut PageDirectory,
    seg: &Segment,
    hdr: &loader::SimpleElf,
    file: &[u8],
) -> KernResult<()> {
    let mut copied = 0usize;
    while copied < seg.len {
        let va = seg.start + copied as u32;
        let page = vm::page_addr(va);
        let space = (page + PAGE_SIZE as u32 - va) as usize;
        let chunk = space.min(seg.len - copied);

        // rodata can share a page with the text tail, bss with the data
        // tail; those pages already exist and must not be recreated.
        let share = match seg.mem_type {
            MemType::Rodata => page_within(page, hdr.txt_start, hdr.txt_len),
            MemType::Bss => page_within(page, hdr.dat_start, hdr.dat_len),
            _ => false,
        };

        let mut created = false;
        if !share {
            if create_page(dir, page, seg.mem_type, None).is_err() {
                return Err(KernError::SegmentPageFail);
            }
            created = true;
        }

        if seg.mem_type == MemType::Bss {
            // Fresh bss pages are zero-fill-on-demand already; only the
            // tail sharing a data page needs explicit zeroing.
            if !created {
                usermem::zero_bytes(dir, va, chunk);
            }
        } else {
            let src = file
                .get(seg.file_off + copied..seg.file_off + copied + chunk)
                .ok_or(KernError::ElfLoadFail)?;
            usermem::write_bytes(dir, va, src);
        }

        copied += space;
    }
    Ok(())
}

/// The exec system call: packet is `{execname*, argv**}`.
pub fn sys_exec(packet: u32) -> i32 {
    let proc = match helper::current_process() {
        Some(p) => p,
        None => return KernError::NoProcess.code(),
    };

    let (name, args) = {
        let dir = proc.pagedir.lock();
        if !helper::check_array(&dir, packet, 2) {
            return KernError::InvalidArg.code();
        }
        let name_ptr = usermem::read_u32(&dir, packet);
        let argv_ptr = usermem::read_u32(&dir, packet + 4);
        if !helper::check_string(&dir, name_ptr) {
            return KernError::InvalidArg.code();
        }
        if !helper::check_string_array(&dir, argv_ptr) {
            return KernError::InvalidArg.code();
        }

        let name = helper::read_string(&dir, name_ptr);
        let count = helper::string_array_length(&dir, argv_ptr);
        let mut args = Vec::with_capacity(count);
        for i in 0..count {
            let p = usermem::read_u32(&dir, argv_ptr + (i * 4) as u32);
            args.push(helper::read_string(&dir, p));
        }
        (name, args)
    };

    to_syscall_ret(do_exec(&name, &args))
}

// ============================================================================
// wait
// ============================================================================

/// Collect an exited child: its status goes through `status_ptr`, its
/// whole subtree of descriptors is reaped, and the child's original tid
/// comes back. Blocks on the process's waiting list while no child has
/// exited yet.
pub fn wait(status_ptr: u32) -> KernResult<i32> {
    let me = thread::get_self();
    let proc = helper::current_process().ok_or(KernError::NoProcess)?;

    if status_ptr != 0 {
        let dir = proc.pagedir.lock();
        if !helper::check_page(&dir, status_ptr, true) {
            return Err(KernError::InvalidArg);
        }
    }

    if proc.children_count() == 0 {
        return Err(KernError::NoChildren);
    }
    // One waiter per child at most; more can never be satisfied.
    if proc.children_count() <= proc.waiting.lock().size() {
        return Err(KernError::WaitFull);
    }

    let child = loop {
        if let Some(child) = process::exited_child(&proc) {
            break child;
        }
        if proc.children_count() == 0 {
            return Err(KernError::ChildrenGone);
        }

        dont_switch_me_out();
        thread::set_waiting(&me)?;

        let other = match thread::get_running().or_else(thread::idle) {
            Some(t) => t,
            None => kernel_panic("nothing left to run"),
        };
        context::context_switch(&me, &other);

        #[cfg(test)]
        if thread::get_self().tid() != me.tid() {
            // The hosted harness cannot park and resume a waiter.
            return Err(KernError::ChildrenGone);
        }
    };

    if status_ptr != 0 {
        let dir = proc.pagedir.lock();
        usermem::write_u32(&dir, status_ptr, child.exit_status() as u32);
    }

    let original_tid = child.original_tid().ok_or(KernError::NoOriginalThread)?;
    process::destroy_process(&child)?;

    Ok(original_tid.0 as i32)
}

pub fn sys_wait(status_ptr: u32) -> i32 {
    to_syscall_ret(wait(status_ptr))
}

// ============================================================================
// vanish
// ============================================================================

/// Terminate the calling thread for good. The last thread out also
/// exits the process: orphans go to init, and a parent thread blocked
/// in wait is woken and switched to directly.
pub fn sys_vanish() {
    let me = thread::get_self();

    dont_switch_me_out();

    if thread::vanish_thread().is_err() {
        kernel_panic("vanish of an unregistered thread");
    }

    let mut other = thread::get_running().or_else(thread::idle);

    let proc = match process::get(me.pid()) {
        Some(p) => p,
        None => kernel_panic("vanish without a process"),
    };

    if proc.live_threads() == 0 {
        if process::vanish_process(&proc).is_err() {
            kernel_panic("process refused to exit");
        }

        // Wake a waiter in the parent, if one is parked.
        if let Some(parent) = proc.parent().and_then(process::get) {
            if let Some(waiting) = thread::get_waiting(&parent) {
                let _ = thread::set_runnable(&waiting);
                other = Some(waiting);
            }
        }
    }

    match other {
        Some(other) => context::context_switch(&me, &other),
        None => {
            // Nothing left to run. On hardware this cannot happen while
            // idle exists; the hosted harness just falls through.
            crate::drivers::timer::you_can_switch_me_out_now();
        }
    }
}

// ============================================================================
// Shared helpers for the scenario tests
// ============================================================================

/// Run `f` as `target`: temporarily make it the scheduler's current
/// thread (tests only).
#[cfg(test)]
pub fn as_thread<R>(target: &Arc<Thread>, f: impl FnOnce() -> R) -> R {
    thread::set_running(target).expect("test thread not schedulable");
    f()
}
