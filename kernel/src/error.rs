// =============================================================================
// MinimalOS NextGen — Kernel Error Types
// =============================================================================

use core::fmt;

/// The five failure kinds every core API maps its failures onto.
///
/// Only `Fatal` ever halts the machine; everything else propagates up to
/// whichever boundary can make a local decision about it — most commonly
/// the syscall dispatcher, which turns any `Err` into `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A physical or virtual allocation could not be satisfied.
    OutOfMemory,
    /// A caller-supplied argument (user pointer, PID, syscall number, ELF
    /// header field) failed validation.
    InvalidArgument,
    /// A lookup (file, PID, free-list block) found nothing.
    NotFound,
    /// An internal invariant was violated but local recovery was possible
    /// (e.g. a heap free-list magic mismatch — the operation is ignored
    /// rather than propagated, but the condition is still worth naming).
    CorruptState,
    /// Unrecoverable: the CPU lacks a required feature, or a boot
    /// precondition is missing. The only error kind that halts the kernel.
    Fatal,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotFound => "not found",
            KernelError::CorruptState => "corrupt state",
            KernelError::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Maps any `KernelResult` onto the syscall ABI's `-1`-on-error convention.
#[inline]
pub fn syscall_result(r: KernelResult<u64>) -> u64 {
    r.unwrap_or(u64::MAX)
}
