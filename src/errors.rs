//! Kernel error catalogue
//!
//! Every fallible kernel operation reports one of these errors. System
//! call entry points convert them to the stable negative integer codes
//! that user space is compiled against, so the numbers here must never
//! change once assigned.

use thiserror::Error;

/// Errors reported by the kernel core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernError {
    // General
    #[error("null argument")]
    ArgNull,
    #[error("negative argument")]
    NegativeArg,
    #[error("invalid thread id")]
    InvalidTid,
    #[error("invalid argument")]
    InvalidArg,
    #[error("kernel heap allocation failed")]
    MallocFail,

    // Thread list discipline
    #[error("thread could not be removed from its list")]
    RemoveFail,
    #[error("thread could not be added to the list")]
    AddFail,
    #[error("thread is already in a list")]
    ThreadInList,

    // Thread management
    #[error("no current thread")]
    SelfNull,
    #[error("yield target is not runnable")]
    YieldNotRunnable,
    #[error("negative sleep duration")]
    NegativeSleep,
    #[error("target thread is not blocked")]
    NotBlocked,

    // Program loading
    #[error("invalid executable header")]
    ElfInvalid,
    #[error("executable load failed")]
    ElfLoadFail,
    #[error("failed to stage exec arguments")]
    SaveArgsFail,
    #[error("failed to create the user stack")]
    CreateUserStackFail,
    #[error("failed to map a segment page")]
    SegmentPageFail,
    #[error("string array too long")]
    ArrayLength,

    // RAM disk
    #[error("no such program in the RAM disk")]
    NoObjEntry,
    #[error("offset past end of file")]
    InvalidOffset,

    // fork
    #[error("process copy failed")]
    CopyProcessFail,
    #[error("thread copy failed")]
    CopyThreadFail,
    #[error("fork with multiple threads")]
    MultipleThreads,

    // wait
    #[error("no children to wait for")]
    NoChildren,
    #[error("no original thread recorded")]
    NoOriginalThread,
    #[error("children disappeared while waiting")]
    ChildrenGone,
    #[error("thread has no process")]
    NoProcess,
    #[error("every child already has a waiter")]
    WaitFull,

    // Frames and pages
    #[error("no free frames")]
    NoFrames,
    #[error("operation on a kernel frame")]
    KernelFrame,
    #[error("freeing a frame owned by nobody")]
    FreeOwnerlessFrame,
    #[error("frame reference count saturated")]
    TooManyFrameOwners,
    #[error("page already present")]
    PageAlreadyPresent,
    #[error("page directory entry not present")]
    DirectoryNotPresent,
    #[error("operation on a kernel page")]
    KernelPage,
    #[error("page not present")]
    PageNotPresent,
    #[error("memregion table is full")]
    WornOutNewPages,

    // vanish
    #[error("process still has active threads")]
    ActiveThreads,
    #[error("process has not exited")]
    ProcessNotExited,
}

impl KernError {
    /// The stable negative integer reported to user space.
    pub fn code(self) -> i32 {
        match self {
            KernError::ArgNull => -2,
            KernError::InvalidTid => -3,
            KernError::RemoveFail => -4,
            KernError::AddFail => -5,
            KernError::SelfNull => -6,
            KernError::YieldNotRunnable => -7,
            KernError::NegativeSleep => -8,
            KernError::NotBlocked => -9,
            KernError::ThreadInList => -10,
            KernError::ElfInvalid => -11,
            KernError::MallocFail => -12,
            KernError::ElfLoadFail => -13,
            KernError::SaveArgsFail => -14,
            KernError::CreateUserStackFail => -15,
            KernError::SegmentPageFail => -16,
            KernError::ArrayLength => -17,
            KernError::NegativeArg => -18,
            KernError::NoObjEntry => -19,
            KernError::InvalidOffset => -20,
            KernError::CopyProcessFail => -21,
            KernError::CopyThreadFail => -22,
            KernError::NoChildren => -23,
            KernError::NoOriginalThread => -25,
            KernError::ChildrenGone => -26,
            KernError::NoProcess => -27,
            KernError::WaitFull => -28,
            KernError::MultipleThreads => -29,
            KernError::NoFrames => -30,
            KernError::ActiveThreads => -31,
            KernError::ProcessNotExited => -32,
            KernError::KernelFrame => -33,
            KernError::InvalidArg => -34,
            KernError::FreeOwnerlessFrame => -35,
            KernError::TooManyFrameOwners => -36,
            KernError::PageAlreadyPresent => -37,
            KernError::DirectoryNotPresent => -38,
            KernError::KernelPage => -39,
            KernError::PageNotPresent => -40,
            KernError::WornOutNewPages => -41,
        }
    }
}

/// Crate-wide result type.
pub type KernResult<T> = Result<T, KernError>;

/// Collapse a `KernResult<i32>` into the integer convention used at the
/// system call boundary: the value on success, a negative code on error.
pub fn to_syscall_ret(res: KernResult<i32>) -> i32 {
    match res {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        let all = [
            KernError::ArgNull,
            KernError::InvalidArg,
            KernError::NoChildren,
            KernError::WaitFull,
            KernError::NoFrames,
            KernError::TooManyFrameOwners,
            KernError::WornOutNewPages,
        ];
        for e in all {
            assert!(e.code() < 0, "{e:?} must map to a negative code");
        }
    }

    #[test]
    fn test_stable_catalogue() {
        // User space is compiled against these exact values.
        assert_eq!(KernError::InvalidArg.code(), -34);
        assert_eq!(KernError::NoChildren.code(), -23);
        assert_eq!(KernError::WaitFull.code(), -28);
        assert_eq!(KernError::NoFrames.code(), -30);
        assert_eq!(KernError::MultipleThreads.code(), -29);
        assert_eq!(KernError::FreeOwnerlessFrame.code(), -35);
    }

    #[test]
    fn test_syscall_ret() {
        assert_eq!(to_syscall_ret(Ok(7)), 7);
        assert_eq!(to_syscall_ret(Err(KernError::InvalidArg)), -34);
    }
}
