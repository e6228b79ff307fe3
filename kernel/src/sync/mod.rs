// =============================================================================
// MinimalOS NextGen — Kernel Synchronization Primitives
// =============================================================================
//
// This module provides synchronization primitives for the kernel.
// In a kernel, we can't use std::sync (there is no std). We need our own
// primitives that work in a bare-metal, multi-core, interrupt-driven
// environment.
//
// IMPORTANT: Lock ordering rules:
//   Level 1 (innermost): PMM bitmap lock
//   Level 2: Page table lock
//   Level 3 (outermost): Process table / scheduler run queue lock
//
// NEVER acquire a lower-level lock while holding a higher-level lock.
// There's no SMP to race against, but interrupt handlers running on the
// same core can still re-enter a lock held by the code they interrupted.
// =============================================================================

pub mod spinlock;

