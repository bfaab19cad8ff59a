//! Simulated processor state
//!
//! Stands in for [`crate::arch::x86`] on non-x86 builds and in the
//! hosted test harness. Privileged state is a handful of words behind a
//! lock; tests read them back to observe what the kernel would have
//! programmed into the hardware.

use spin::Mutex;

/// The privileged state a real processor would hold.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimState {
    /// Last value programmed into the TSS esp0 slot.
    pub esp0: usize,
    /// Current page-directory root.
    pub page_directory: usize,
    /// Faulting address, as cr2 would report it.
    pub cr2: u32,
    /// TLB flush count, for tests asserting invalidation happened.
    pub tlb_flushes: u32,
    /// Are interrupts enabled?
    pub interrupts: bool,
    /// Last user-mode entry requested via `launch`.
    pub launched: Option<(u32, u32)>,
}

static SIM: Mutex<SimState> = Mutex::new(SimState {
    esp0: 0,
    page_directory: 0,
    cr2: 0,
    tlb_flushes: 0,
    interrupts: false,
    launched: None,
});

/// Snapshot the simulated state (test observation point).
pub fn sim_state() -> SimState {
    *SIM.lock()
}

/// Reset the simulated state between tests.
pub fn sim_reset() {
    *SIM.lock() = SimState::default();
}

/// Record a faulting address for the next page-fault dispatch.
pub fn sim_set_cr2(addr: u32) {
    SIM.lock().cr2 = addr;
}

pub fn get_cr2() -> u32 {
    SIM.lock().cr2
}

pub fn set_page_directory(root: usize) {
    let mut sim = SIM.lock();
    sim.page_directory = root;
    sim.tlb_flushes += 1;
}

pub fn get_page_directory() -> usize {
    SIM.lock().page_directory
}

pub fn flush_tlb() {
    SIM.lock().tlb_flushes += 1;
}

pub fn enable_paging() {}

pub fn set_esp0(esp0: usize) {
    SIM.lock().esp0 = esp0;
}

pub fn enable_interrupts() {
    SIM.lock().interrupts = true;
}

pub fn disable_interrupts() {
    SIM.lock().interrupts = false;
}

pub fn outb(_port: u16, _value: u8) {}

pub fn inb(_port: u16) -> u8 {
    0
}

pub fn halt() {}

/// Record a transfer to user mode. The simulation cannot actually run
/// user code, so this returns; callers treat it as the end of the road.
pub fn launch(eip: u32, esp3: u32) {
    SIM.lock().launched = Some((eip, esp3));
}

pub fn idt_store(_index: usize, _gate: u64) {}
