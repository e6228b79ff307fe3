//! Syscall infrastructure for x86_64.
//!
//! Enables the `syscall` instruction via MSR configuration and provides the
//! assembly entry stub that swaps to the kernel stack, saves the caller's
//! registers, and dispatches to the Rust handler.
//!
//! Every *return* to ring 3 — both the initial process dispatch and every
//! syscall return — goes through a manually built `iretq` frame rather than
//! `sysretq` (see `arch::gdt` for why). `syscall` is still the cheaper entry
//! path, so it's kept for the ring3→ring0 direction; only STAR's kernel
//! segment field matters here, since nothing built from STAR's sysret field
//! is ever used.

use core::arch::{asm, naked_asm};

use alloc::string::String;
use alloc::vec::Vec;

use crate::config;
use crate::error::{KernelError, KernelResult};
use crate::task::process;

// ── MSR addresses ───────────────────────────────────────────────

const MSR_EFER: u32 = 0xC000_0080;
const MSR_STAR: u32 = 0xC000_0081;
const MSR_LSTAR: u32 = 0xC000_0082;
const MSR_SFMASK: u32 = 0xC000_0084;

const EFER_SCE: u64 = 1 << 0;
const RFLAGS_IF: u64 = 1 << 9;

// ── Scratch space (single-CPU) ──────────────────────────────────

#[unsafe(no_mangle)]
static mut SYSCALL_USER_RSP: u64 = 0;

/// Kernel stack pointer loaded by the syscall stub. Rewritten on every
/// context switch so `syscall` always lands on the current process's
/// kernel stack.
#[unsafe(no_mangle)]
pub static mut SYSCALL_KERNEL_RSP: u64 = 0;

#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}

#[inline]
unsafe fn wrmsr(msr: u32, value: u64) {
    let lo = value as u32;
    let hi = (value >> 32) as u32;
    unsafe {
        asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Enable the `syscall` instruction and configure STAR / LSTAR / SFMASK.
///
/// # Safety
/// Must be called exactly once, after the GDT and TSS are loaded.
pub unsafe fn init(kernel_rsp: u64) {
    unsafe {
        SYSCALL_KERNEL_RSP = kernel_rsp;
    }

    let efer = unsafe { rdmsr(MSR_EFER) };
    unsafe { wrmsr(MSR_EFER, efer | EFER_SCE) };
    log::debug!("EFER = {:#x} -> {:#x} (SCE enabled)", efer, efer | EFER_SCE);

    // Only STAR[47:32] (the kernel code base `syscall` uses for CS, with SS
    // implicitly CS+8) matters now — nothing takes the `sysretq` path, so
    // STAR's high field is never consulted.
    let star: u64 = 0x0008u64 << 32;
    unsafe { wrmsr(MSR_STAR, star) };
    log::debug!("STAR = {:#018x}", star);

    let handler_addr = syscall_entry as usize as u64;
    unsafe { wrmsr(MSR_LSTAR, handler_addr) };
    log::debug!("LSTAR = {:#x} (syscall_entry)", handler_addr);

    unsafe { wrmsr(MSR_SFMASK, RFLAGS_IF) };
    log::debug!("SFMASK = {:#x} (mask IF)", RFLAGS_IF);

    log::info!("syscall enabled (EFER.SCE=1, STAR={:#018x})", star);
}

// ── Assembly entry stub ─────────────────────────────────────────
//
// On `syscall`: RCX = user RIP, R11 = user RFLAGS, RSP still the user stack.
//
// Register convention (Linux-style):
//   RAX = syscall number, RAX = return value
//   RDI, RSI, RDX, R10, R8, R9 = arguments 0-5

/// The raw `syscall` entry point.
///
/// # Safety
/// Invoked directly by the CPU on `syscall`; never called from Rust.
#[naked]
unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "mov [rip + SYSCALL_USER_RSP], rsp",
        "mov rsp, [rip + SYSCALL_KERNEL_RSP]",

        // Pushed in this order, the resulting stack layout matches
        // `task::process::SyscallFrame` (low to high address): user_rsp,
        // r15, r14, r13, r12, rbx, rbp, user_rflags (r11), user_rip (rcx).
        "push rcx",
        "push r11",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push qword ptr [rip + SYSCALL_USER_RSP]",

        // Shuffle the Linux-convention argument registers into SysV slots
        // for `syscall_dispatch(nr, a0, a1, a2, a3, a4)`.
        "mov r15, rdi",
        "mov rdi, rax",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, r15",
        "mov r9, r8",
        "mov r8, r10",

        "call syscall_dispatch",

        // Rewrite the saved user-mode return path for signal delivery or
        // SigReturn before restoring any register. RSP is unchanged by the
        // call (net effect of `call`/`ret` is zero), so it still points at
        // the pushed frame — matches `SyscallFrame`'s layout exactly.
        "mov rdi, rsp",
        "push rax",
        "call deliver_pending_signal",
        "pop rax",

        "pop r15",
        "mov [rip + SYSCALL_USER_RSP], r15",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "pop r11",
        "pop rcx",

        // Build an `iretq` frame on the kernel stack rather than `sysretq`:
        // pushed low-to-high as SS, RSP, RFLAGS, CS, RIP so the last push
        // (RIP) sits on top, matching what `iretq` expects to pop.
        "push 0x23",
        "push qword ptr [rip + SYSCALL_USER_RSP]",
        "push r11",
        "push 0x1b",
        "push rcx",
        "iretq",
    );
}

// ── Syscall numbers ──────────────────────────────────────────────

/// The fixed syscall call-number table. Numbers not listed here, along
/// with `Open`/`Close`/`Fork`/`Mmap`/`Munmap`/`FBMap` (reserved for a
/// future filesystem/VM layer), always return `-1`.
pub mod nr {
    pub const EXIT: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const READ: u64 = 2;
    pub const GET_PID: u64 = 5;
    pub const EXEC: u64 = 7;
    pub const WAIT: u64 = 8;
    pub const KILL: u64 = 9;
    pub const YIELD: u64 = 12;
    pub const SLEEP: u64 = 13;
    pub const GET_TIME: u64 = 14;
    pub const CLEAR: u64 = 15;
    pub const FB_INFO: u64 = 16;
    pub const SIGNAL: u64 = 18;
    pub const SIG_RETURN: u64 = 19;
}

// ── User-pointer validation ─────────────────────────────────────

/// Validate that `[ptr, ptr+len)` is a well-formed user-space range: not
/// null, doesn't overflow, and falls entirely below `config::USER_SPACE_END`.
#[inline]
pub fn validate_user_ptr(ptr: u64, len: usize) -> bool {
    if ptr == 0 {
        return false;
    }
    if len == 0 {
        return true;
    }
    match ptr.checked_add(len as u64) {
        Some(end) => end <= config::USER_SPACE_END,
        None => false,
    }
}

fn copy_user_cstr(ptr: u64, max_len: usize) -> KernelResult<String> {
    let mut buf = Vec::new();
    let mut p = ptr;
    loop {
        if buf.len() >= max_len {
            return Err(KernelError::InvalidArgument);
        }
        if !validate_user_ptr(p, 1) {
            return Err(KernelError::InvalidArgument);
        }
        let byte = unsafe { core::ptr::read(p as *const u8) };
        if byte == 0 {
            break;
        }
        buf.push(byte);
        p += 1;
    }
    String::from_utf8(buf).map_err(|_| KernelError::InvalidArgument)
}

/// Reads a NULL-terminated array of string pointers out of user memory.
fn copy_user_argv(ptr: u64) -> KernelResult<Vec<String>> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    let mut result = Vec::new();
    for i in 0..64u64 {
        let entry_addr = ptr + i * 8;
        if !validate_user_ptr(entry_addr, 8) {
            return Err(KernelError::InvalidArgument);
        }
        let str_ptr = unsafe { core::ptr::read(entry_addr as *const u64) };
        if str_ptr == 0 {
            return Ok(result);
        }
        result.push(copy_user_cstr(str_ptr, 256)?);
    }
    Err(KernelError::InvalidArgument)
}

/// Info written back to user memory by `FBInfo`.
#[repr(C)]
struct UserFbInfo {
    addr: u64,
    width: u64,
    height: u64,
    pitch: u64,
    bpp: u32,
    _pad: u32,
}

/// Rust syscall dispatcher, called from the assembly stub.
///
/// Returns the syscall result in RAX; errors map to `u64::MAX` (-1).
#[unsafe(no_mangle)]
unsafe extern "C" fn syscall_dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, _a4: u64) -> u64 {
    match nr {
        nr::EXIT => {
            log::info!("sys_exit(code={})", a0);
            process::exit_current(a0);
            unsafe { process::do_schedule() };
            // Either rescheduled into another process (never returns here)
            // or this was the last task — nothing left to run.
            log::warn!("sys_exit: no other process to schedule, halting");
            crate::arch::cpu::halt_forever();
        }
        nr::WRITE => {
            let (fd, ptr, len) = (a0, a1, a2 as usize);
            if fd != 1 && fd != 2 {
                return u64::MAX;
            }
            if !validate_user_ptr(ptr, len) {
                return u64::MAX;
            }
            let slice = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
            match core::str::from_utf8(slice) {
                Ok(s) => {
                    crate::kprint!("{}", s);
                    len as u64
                }
                Err(_) => u64::MAX,
            }
        }
        nr::READ => {
            // No keyboard driver is wired up yet — there's no input source
            // to block on, so every read fails rather than hanging forever.
            u64::MAX
        }
        nr::GET_PID => process::current_pid().unwrap_or(u64::MAX),
        nr::EXEC => {
            let path = match copy_user_cstr(a0, 256) {
                Ok(p) => p,
                Err(_) => return u64::MAX,
            };
            let argv = match copy_user_argv(a1) {
                Ok(v) => v,
                Err(_) => return u64::MAX,
            };
            let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
            let parent = process::current_pid();
            match process::spawn(&path, &argv_refs, parent) {
                Ok(pid) => pid,
                Err(_) => u64::MAX,
            }
        }
        nr::WAIT => {
            let (pid, status_out) = (a0, a1);
            match process::wait(pid) {
                Some(code) => {
                    if status_out != 0 && validate_user_ptr(status_out, 8) {
                        unsafe { core::ptr::write(status_out as *mut u64, code) };
                    }
                    0
                }
                None => u64::MAX,
            }
        }
        nr::KILL => {
            let (pid, sig) = (a0, a1 as u8);
            if process::kill(pid, sig) {
                0
            } else {
                u64::MAX
            }
        }
        nr::YIELD => {
            unsafe { process::do_schedule() };
            0
        }
        nr::SLEEP => {
            let ms = a0;
            let deadline = crate::task::clock::now() + ms;
            process::sleep_until(deadline);
            0
        }
        nr::GET_TIME => crate::task::clock::now(),
        nr::CLEAR => {
            crate::kprint!("\x1b[2J\x1b[H");
            0
        }
        nr::FB_INFO => {
            let info_out = a0;
            if !validate_user_ptr(info_out, core::mem::size_of::<UserFbInfo>()) {
                return u64::MAX;
            }
            let Some(fb) = crate::arch::boot::get_framebuffer_info() else {
                return u64::MAX;
            };
            let phys = fb.address as u64 - crate::arch::boot::get_hhdm_offset();
            let user_fb = UserFbInfo {
                addr: config::USER_FRAMEBUFFER_BASE,
                width: fb.width,
                height: fb.height,
                pitch: fb.pitch,
                bpp: fb.bpp as u32,
                _pad: 0,
            };
            if map_framebuffer(phys, fb.pitch * fb.height).is_err() {
                return u64::MAX;
            }
            unsafe { core::ptr::write(info_out as *mut UserFbInfo, user_fb) };
            0
        }
        nr::SIGNAL => {
            let (sig, handler) = (a0 as u8, a1);
            match process::set_signal_handler(sig, handler) {
                Ok(()) => 0,
                Err(_) => u64::MAX,
            }
        }
        nr::SIG_RETURN => match process::request_sigreturn() {
            Ok(()) => 0,
            Err(_) => u64::MAX,
        },
        _ => {
            log::warn!("unknown syscall nr={}", nr);
            u64::MAX
        }
    }
}

/// Map the framebuffer into the current process's address space at
/// `config::USER_FRAMEBUFFER_BASE`, one page at a time.
fn map_framebuffer(phys_base: u64, len: u64) -> KernelResult<()> {
    use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
    use crate::memory::vmm::{self, PageTableFlags};

    let pml4 = {
        let mut sched = process::SCHEDULER.lock();
        sched.current().ok_or(KernelError::CorruptState)?.pml4
    };

    let pages = len.div_ceil(PAGE_SIZE);
    let flags = PageTableFlags::PRESENT
        | PageTableFlags::WRITABLE
        | PageTableFlags::USER
        | PageTableFlags::NO_EXECUTE;

    for i in 0..pages {
        let virt = VirtAddr::new(config::USER_FRAMEBUFFER_BASE + i * PAGE_SIZE);
        let phys = PhysAddr::new(phys_base + i * PAGE_SIZE);
        match unsafe { vmm::map_page(pml4, virt, phys, flags) } {
            Ok(()) | Err(vmm::MapError::AlreadyMapped) => {}
            Err(_) => return Err(KernelError::CorruptState),
        }
    }
    Ok(())
}
