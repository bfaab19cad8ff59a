//! Architecture support for IA-32
//!
//! Everything that touches privileged processor state goes through this
//! module: control registers, the TSS, interrupt masking, port I/O and
//! the transfer to user mode. On a real 32-bit x86 build the operations
//! compile to the obvious instructions; everywhere else (including the
//! hosted test build) they hit a small simulation layer so the rest of
//! the kernel can be exercised off the metal.

#[cfg(all(target_arch = "x86", not(test)))]
mod x86;
#[cfg(all(target_arch = "x86", not(test)))]
pub use x86::*;

#[cfg(not(all(target_arch = "x86", not(test))))]
mod sim;
#[cfg(not(all(target_arch = "x86", not(test))))]
pub use sim::*;

// ============================================================================
// Segment Selectors
// ============================================================================

/// Kernel code segment selector
pub const SEGSEL_KERNEL_CS: u16 = 0x10;
/// Kernel data segment selector
pub const SEGSEL_KERNEL_DS: u16 = 0x18;
/// User code segment selector (RPL 3)
pub const SEGSEL_USER_CS: u16 = 0x23;
/// User data segment selector (RPL 3)
pub const SEGSEL_USER_DS: u16 = 0x2b;

/// GDT index of the user code segment
pub const SEGSEL_USER_CS_IDX: u32 = 4;
/// GDT index of the user data segment
pub const SEGSEL_USER_DS_IDX: u32 = 5;

// ============================================================================
// EFLAGS
// ============================================================================

/// Flags user code may change through swexn: CF, PF, AF, ZF, SF, DF, OF.
pub const AUTHORIZED_FLAGS: u32 = 0x0000_0cd5;

/// Always-set reserved bit plus interrupts enabled; the base eflags for a
/// fresh user context.
pub const USER_EFLAGS: u32 = 0x0000_0202;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_indices() {
        assert_eq!((SEGSEL_USER_CS as u32 & 0xfff8) >> 3, SEGSEL_USER_CS_IDX);
        assert_eq!((SEGSEL_USER_DS as u32 & 0xfff8) >> 3, SEGSEL_USER_DS_IDX);
    }

    #[test]
    fn test_authorized_flags_exclude_if() {
        // User code must never toggle the interrupt flag.
        assert_eq!(AUTHORIZED_FLAGS & 0x200, 0);
    }
}
