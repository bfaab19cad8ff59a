//! Granite kernel binary entry point
//!
//! Boot brings the world up in a fixed order: heap, console, paging,
//! thread tables, system calls, drivers, then the first ("god")
//! process, which execs the root program that forks-and-execs `idle`,
//! `init` and `shell`. Mutexes go operational and interrupts turn on
//! only once a running thread exists.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod kernel {
    use alloc::string::String;
    use alloc::vec;
    use core::panic::PanicInfo;

    use granite::{arch, console, drivers, kern, lock, memory, ramdisk, syscall, vm};
    use granite::arch::SEGSEL_KERNEL_CS;
    use granite::interrupt::{create_trap_idt_entry, insert_to_idt, vector, TrapGate};
    use granite::kern::context::stubs;
    use granite::println;

    extern crate alloc;

    /// What the boot stub tells us about the machine.
    pub struct BootInfo {
        /// Upper memory size in kilobytes (multiboot `mem_upper`).
        pub upper_mem_kb: u32,
    }

    /// User program images linked into this binary. The build step
    /// replaces this table with the packaged RAM disk.
    static PROGRAMS: &[ramdisk::Entry] = &[];

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        kernel_main(BootInfo {
            upper_mem_kb: 255 * 1024,
        })
    }

    fn kernel_main(boot: BootInfo) -> ! {
        // The heap first: everything after this allocates.
        memory::init();

        console::init();
        println!("=== {} {} ===", granite::NAME, granite::VERSION);

        println!("[INIT] Paging...");
        vm::page::install_paging(boot.upper_mem_kb);
        install_exceptions();

        println!("[INIT] Threads...");
        kern::thread::init();

        println!("[INIT] System calls...");
        syscall::install_syscalls();

        println!("[INIT] Drivers...");
        drivers::install_handlers();

        println!("[INIT] RAM disk...");
        ramdisk::install(PROGRAMS);

        // The first process. It gets a user stack by hand, because
        // there is no one to fork from.
        println!("[INIT] First process...");
        let god = kern::process::create_god_process().expect("unable to create god process");
        let thread = kern::thread::create_thread(&god).expect("unable to create god thread");
        kern::thread::set_running(&thread).expect("unable to dispatch god thread");

        // A running thread exists: locks may suspend now.
        lock::mutex::install();
        arch::enable_interrupts();

        let args = vec![String::from("god")];
        let err = syscall::lifecycle::do_exec("god", &args);
        println!("THERE IS NO GOD ({:?})", err);
        granite::panic::kernel_panic("boot failed");
    }

    /// Wire the exception vectors to their wrappers.
    fn install_exceptions() {
        let mut gate = TrapGate {
            segment: SEGSEL_KERNEL_CS,
            offset: 0,
            privilege_level: 0,
        };

        let table: [(usize, u32); 14] = [
            (vector::DIVIDE, stubs::divide_handler as usize as u32),
            (vector::DEBUG, stubs::debug_handler as usize as u32),
            (vector::BREAKPOINT, stubs::breakpoint_handler as usize as u32),
            (vector::OVERFLOW, stubs::overflow_handler as usize as u32),
            (vector::BOUNDCHECK, stubs::boundcheck_handler as usize as u32),
            (vector::OPCODE, stubs::opcode_handler as usize as u32),
            (vector::NOFPU, stubs::nofpu_handler as usize as u32),
            (vector::SEGFAULT, stubs::segfault_handler as usize as u32),
            (vector::STACKFAULT, stubs::stackfault_handler as usize as u32),
            (vector::PROTFAULT, stubs::protfault_handler as usize as u32),
            (vector::PAGEFAULT, stubs::page_fault_stub as usize as u32),
            (vector::FPUFAULT, stubs::fpufault_handler as usize as u32),
            (vector::ALIGNFAULT, stubs::alignfault_handler as usize as u32),
            (vector::SIMDFAULT, stubs::simdfault_handler as usize as u32),
        ];
        for (vec, offset) in table {
            gate.offset = offset;
            insert_to_idt(create_trap_idt_entry(&gate), vec);
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("\n*** KERNEL PANIC ***");
        if let Some(location) = info.location() {
            println!("at {}:{}", location.file(), location.line());
        }
        println!("{}", info.message());
        loop {
            arch::halt();
        }
    }
}

/// Hosted builds have no machine to boot; the kernel is exercised
/// through `cargo test` instead.
#[cfg(not(target_arch = "x86"))]
fn main() {
    eprintln!("granite is a 32-bit x86 kernel; build with an i686 target to boot it");
    eprintln!("(the hosted test suite runs with `cargo test`)");
}
