//! Interrupt and exception handlers.

use x86_64::structures::idt::{InterruptStackFrame, PageFaultErrorCode};

use crate::arch::cpu;

/// IST index used for the double fault handler's dedicated stack (1-based,
/// as written into the IDT gate — IST0 means "no IST").
pub const DOUBLE_FAULT_IST_INDEX: u16 = 1;

/// Breakpoint exception handler (INT 3), triggered by `int3`.
pub extern "x86-interrupt" fn breakpoint_handler(_stack_frame: InterruptStackFrame) {
    log::info!("breakpoint exception");
}

/// Double fault handler (INT 8). Runs on its own IST stack so a double
/// fault caused by kernel stack exhaustion doesn't immediately triple-fault.
/// There is no recovery from a double fault: halt.
pub extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    log::error!("double fault (error code {}): {:#?}", error_code, stack_frame);
    cpu::halt_forever();
}

/// Timer interrupt handler (vector 32). Advances the tick counter and
/// drives preemptive round-robin scheduling.
pub extern "x86-interrupt" fn timer_handler(_stack_frame: InterruptStackFrame) {
    crate::task::clock::tick();
    crate::task::process::on_timer_tick();
}

/// Spurious interrupt handler (vector 0xFF). No EOI needed for a spurious
/// vector on most APIC implementations; this just acknowledges and returns.
pub extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {}

/// Page fault handler (INT 14). The kernel does not implement demand
/// paging or copy-on-write, so every page fault here is an error: log the
/// faulting address from CR2 and halt. A real recovery path (growing a
/// stack, handling COW) would intercept specific cases before falling
/// through to this.
pub extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let fault_addr = cpu::read_cr2();
    log::error!(
        "page fault at {:#018X} (error {:?}): {:#?}",
        fault_addr,
        error_code,
        stack_frame
    );
    cpu::halt_forever();
}
