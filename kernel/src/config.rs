// =============================================================================
// MinimalOS NextGen — Boot-Time Configuration
// =============================================================================
//
// Centralizes the tunables that would otherwise be scattered magic numbers
// across the memory, scheduling, and user-layout code.
// =============================================================================

use crate::memory::address::PAGE_SIZE;

/// Fixed virtual base address of the kernel heap. Unlike the physical
/// backing frames (which come from wherever the PMM finds free memory),
/// the heap always lives at this address so pointers remain stable across
/// growth and are never tied to where HHDM happens to map a given frame.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Initial size of the kernel heap, in bytes.
pub const KERNEL_HEAP_INITIAL_SIZE: u64 = 1024 * 1024;

/// Initial size of the kernel heap, in 4 KiB pages.
pub const KERNEL_HEAP_INITIAL_PAGES: usize =
    (KERNEL_HEAP_INITIAL_SIZE / PAGE_SIZE) as usize;

/// Size of each process's kernel-mode stack, in bytes.
pub const KERNEL_STACK_SIZE: usize = 4096 * 4;

/// Size of each process's user-mode stack, in bytes.
pub const USER_STACK_SIZE: usize = 4096 * 16;

/// Virtual address a process's user stack is mapped to end at (top).
pub const USER_STACK_TOP: u64 = 0x0000_7000_0000_0000 - PAGE_SIZE;

/// Virtual address the framebuffer is mapped to inside a process that asks
/// for it via `FBInfo`/`FBMap`.
pub const USER_FRAMEBUFFER_BASE: u64 = 0x0000_7000_0000_0000;

/// Highest virtual address still considered user space (exclusive).
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest virtual address considered kernel space.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Number of timer ticks a process runs before the scheduler preempts it.
pub const SCHEDULER_QUANTUM_TICKS: u64 = 5;

/// Number of entries in a process's signal handler table.
pub const SIGNAL_TABLE_SIZE: usize = 32;
