//! Process management — PCB, context switching, and scheduling.
//!
//! A process owns a kernel stack, a user address space, and a slot in the
//! round-robin ready queue. `context_switch_asm` swaps between two kernel
//! stacks; it never touches CR3 or TSS.RSP0 itself — `do_schedule` updates
//! those around the switch because they're properties of *which* process is
//! current, not of the stack-swap mechanism.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config;
use crate::error::{KernelError, KernelResult};
use crate::fs::{elf, vfs};
use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::vmm::{self, PageTableFlags};
use crate::memory::pmm;

// ── Process identifiers ─────────────────────────────────────────

/// Monotonically increasing PID counter. Logically belongs to the
/// scheduler; kept as a free-standing atomic so `alloc_pid` doesn't need
/// the scheduler lock held across process construction.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

fn alloc_pid() -> u64 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

// ── Process state ───────────────────────────────────────────────

/// The possible states of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Constructed but not yet placed on the ready queue.
    New,
    /// Ready to be scheduled.
    Ready,
    /// Currently running on the CPU.
    Running,
    /// Blocked waiting for an event. Nothing currently produces this state
    /// — no blocking I/O source (keyboard, disk) is wired up yet — but it's
    /// part of the lifecycle a future input driver will need.
    Blocked,
    /// Terminated; its exit code is held in a zombie record until `wait`
    /// reaps it.
    Terminated,
}

// ── Context (saved registers) ───────────────────────────────────

/// Callee-saved register context for `context_switch_asm`.
///
/// Only the callee-saved registers plus the return RIP live here. The full
/// caller-saved register file doesn't need its own struct: a voluntary
/// switch only ever happens from inside a `call` (a syscall or a timer
/// interrupt), and the compiler-generated prologue for those entry points
/// (the naked syscall stub's explicit pushes, or the `x86-interrupt` ABI's
/// own frame) already preserves whatever caller-saved state needs to
/// survive the switch. `context_switch_asm` only needs to carry the
/// registers the System V ABI doesn't already save on its behalf.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            rip: 0,
        }
    }
}

// ── Kernel stack ────────────────────────────────────────────────

/// An aligned kernel stack, sized per `config::KERNEL_STACK_SIZE`.
#[repr(C, align(16))]
pub struct KernelStack {
    pub data: [u8; config::KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Top of the stack (stacks grow downward).
    pub fn top(&self) -> u64 {
        self.data.as_ptr() as u64 + config::KERNEL_STACK_SIZE as u64
    }
}

/// Saved user-mode RIP/RSP, recorded across a signal delivery so
/// `SigReturn` can restore exactly where the process was interrupted.
#[derive(Debug, Clone, Copy)]
struct SignalReturnFrame {
    rip: u64,
    rsp: u64,
}

// ── Process Control Block ───────────────────────────────────────

/// The Process Control Block — everything the kernel needs to manage and
/// schedule a single task.
pub struct Process {
    pub pid: u64,
    pub parent_pid: Option<u64>,
    pub name: String,
    pub state: ProcessState,
    /// Saved kernel RSP (points into `kernel_stack`), updated by
    /// `context_switch_asm` when suspending.
    pub kernel_rsp: u64,
    /// Physical address of this process's PML4 (its address space root).
    pub pml4: PhysAddr,
    /// The user-mode entry point (RIP for the initial `iretq`).
    pub entry_point: u64,
    /// User-mode stack pointer at the moment the process was last entered.
    pub user_rsp: u64,
    pub kernel_stack: Box<KernelStack>,
    /// Set once `wait` has something to report; `None` while still alive.
    pub exit_code: Option<u64>,
    /// Per-signal handler addresses; `None` means "no handler installed"
    /// (default disposition — currently: ignore).
    pub signal_table: [Option<u64>; config::SIGNAL_TABLE_SIZE],
    /// Bitmask of signals raised but not yet delivered.
    pending_signals: u32,
    signal_return_frame: Option<SignalReturnFrame>,
    sigreturn_pending: bool,
    /// True once this process has been entered into user mode at least
    /// once; guards signal delivery against acting on a process that has
    /// no saved user-mode register state yet.
    pub valid_user_state_flag: bool,
    argc: u64,
    argv_ptr: u64,
}

impl Process {
    /// Create a new process. `pml4` is the address space root, `entry_point`
    /// the user RIP, `user_rsp`/`argc`/`argv_ptr` the initial stack state
    /// built by `setup_user_stack`.
    fn new(
        name: &str,
        parent_pid: Option<u64>,
        pml4: PhysAddr,
        entry_point: u64,
        user_rsp: u64,
        argc: u64,
        argv_ptr: u64,
    ) -> Self {
        let pid = alloc_pid();
        // Allocate the kernel stack directly on the heap rather than
        // building it on the current stack first — spawning from syscall
        // context leaves little headroom to spare.
        let kernel_stack = unsafe {
            let layout = core::alloc::Layout::new::<KernelStack>();
            let ptr = alloc::alloc::alloc_zeroed(layout) as *mut KernelStack;
            if ptr.is_null() {
                panic!("failed to allocate kernel stack for PID {}", pid);
            }
            Box::from_raw(ptr)
        };

        Self {
            pid,
            parent_pid,
            name: String::from(name),
            state: ProcessState::New,
            kernel_rsp: 0,
            pml4,
            entry_point,
            user_rsp,
            kernel_stack,
            exit_code: None,
            signal_table: [None; config::SIGNAL_TABLE_SIZE],
            pending_signals: 0,
            signal_return_frame: None,
            sigreturn_pending: false,
            valid_user_state_flag: false,
            argc,
            argv_ptr,
        }
    }

    /// Lay out the kernel stack as if `context_switch_asm` had just
    /// suspended this task, so the first switch into it lands in
    /// `task_entry_trampoline`.
    fn prepare_initial_stack(&mut self) {
        let top = self.kernel_stack.top();
        let sp = top - 7 * 8;

        // SAFETY: freshly allocated stack, large enough for 7 u64s.
        unsafe {
            let ptr = sp as *mut u64;
            // Must match the pop order in context_switch_asm.
            ptr.add(0).write(0); // r15
            ptr.add(1).write(0); // r14
            ptr.add(2).write(0); // r13
            ptr.add(3).write(0); // r12
            ptr.add(4).write(0); // rbx
            ptr.add(5).write(0); // rbp
            ptr.add(6).write(task_entry_trampoline as u64); // rip
        }

        self.kernel_rsp = sp;
        self.state = ProcessState::Ready;
    }

    fn take_pending_signal(&mut self) -> Option<u8> {
        if self.pending_signals == 0 {
            return None;
        }
        let sig = self.pending_signals.trailing_zeros() as u8;
        self.pending_signals &= !(1 << sig);
        Some(sig)
    }

    fn raise_signal(&mut self, sig: u8) {
        if (sig as usize) < config::SIGNAL_TABLE_SIZE {
            self.pending_signals |= 1 << sig;
        }
    }
}

// ── Context switch ───────────────────────────────────────────────

core::arch::global_asm!(
    ".global context_switch_asm",
    "context_switch_asm:",
    // rdi = &mut old_task.kernel_rsp
    // rsi = new_task.kernel_rsp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

unsafe extern "C" {
    fn context_switch_asm(old_rsp_ptr: *mut u64, new_rsp: u64);
}

// ── Trampoline for first entry ──────────────────────────────────

/// When a newly-created task is switched to for the first time,
/// `context_switch_asm` `ret`s into this function, which drops to Ring 3.
extern "C" fn task_entry_trampoline() -> ! {
    let (entry, user_rsp, argc, argv_ptr) = {
        let mut sched = SCHEDULER.lock();
        let current = sched.current_mut().expect("trampoline: no current task");
        current.valid_user_state_flag = true;
        (current.entry_point, current.user_rsp, current.argc, current.argv_ptr)
    };

    log::info!("entering user mode: rip={:#x} rsp={:#x}", entry, user_rsp);

    // User code = 0x1B, user data = 0x23 (see arch::gdt::Gdt).
    let frame = super::usermode::IretqFrame::new(entry, 0x1B, 0x23, user_rsp);
    unsafe { super::usermode::jump_to_ring3_with_args(&frame, argc, argv_ptr) }
}

// ── Zombies ───────────────────────────────────────────────────────

/// What's left of a process after it exits: enough for `wait` to report
/// the exit code and reclaim the address space root, without keeping its
/// kernel stack (freed immediately at exit) around.
struct Zombie {
    pid: u64,
    #[allow(dead_code)]
    parent_pid: Option<u64>,
    exit_code: u64,
    pml4: PhysAddr,
}

// ── Scheduler ───────────────────────────────────────────────────

/// The global scheduler instance, protected by a spinlock.
pub static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Round-robin scheduler: a ready queue, the currently running process,
/// and a zombie list awaiting `wait`.
pub struct Scheduler {
    tasks: VecDeque<Process>,
    current: Option<Process>,
    zombies: VecDeque<Zombie>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            current: None,
            zombies: VecDeque::new(),
        }
    }

    pub fn push(&mut self, task: Process) {
        self.tasks.push_back(task);
    }

    pub fn ready_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len() + if self.current.is_some() { 1 } else { 0 }
    }

    pub fn current(&self) -> Option<&Process> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Process> {
        self.current.as_mut()
    }

    /// Set the initial "current" process (used once during kernel init).
    pub fn set_current(&mut self, mut task: Process) {
        task.state = ProcessState::Running;
        self.current = Some(task);
    }

    /// Find a live process (current or ready) by PID.
    fn find_mut(&mut self, pid: u64) -> Option<&mut Process> {
        if let Some(cur) = self.current.as_mut() {
            if cur.pid == pid {
                return Some(cur);
            }
        }
        self.tasks.iter_mut().find(|t| t.pid == pid)
    }

    fn take_zombie(&mut self, pid: u64) -> Option<Zombie> {
        let idx = self.zombies.iter().position(|z| z.pid == pid)?;
        self.zombies.remove(idx)
    }
}

/// Schedule-and-switch, safely managing the scheduler lock.
///
/// Acquires the lock, rotates the ready queue, updates the syscall/TSS
/// kernel-stack pointers for whichever process becomes current, drops the
/// lock, then performs the raw context switch.
///
/// # Safety
/// Must be called with interrupts disabled (timer interrupt context) or
/// equivalent (syscall dispatch, which also runs with IF=0 on entry).
pub unsafe fn do_schedule() {
    // Dummy destination for the old RSP when the old task is dead — there's
    // nowhere meaningful to store it since nobody will ever switch back in.
    static mut DEAD_RSP: u64 = 0;

    let (old_rsp_ptr, new_rsp) = {
        let mut sched = SCHEDULER.lock();

        if sched.tasks.is_empty() {
            return;
        }

        let old = match sched.current.take() {
            Some(t) => t,
            None => return,
        };

        let new = match sched.tasks.pop_front() {
            Some(t) => t,
            None => {
                sched.current = Some(old);
                return;
            }
        };

        let old_is_dead = old.state == ProcessState::Terminated;

        if old_is_dead {
            sched.zombies.push_back(Zombie {
                pid: old.pid,
                parent_pid: old.parent_pid,
                exit_code: old.exit_code.unwrap_or(0),
                pml4: old.pml4,
            });
            // `old` drops here — its kernel stack is freed right away.
            // Safe even though we're still executing on it: control never
            // returns to this task, and nothing touches these pages again
            // after the switch below.
        } else {
            let mut old = old;
            old.state = ProcessState::Ready;
            sched.tasks.push_back(old);
        }

        let mut new = new;
        new.state = ProcessState::Running;
        sched.current = Some(new);

        let new_kstack_top = sched.current.as_ref().unwrap().kernel_stack.top();
        unsafe {
            core::ptr::write_volatile(
                &raw mut crate::arch::syscall::SYSCALL_KERNEL_RSP,
                new_kstack_top,
            );
            let tss = crate::traps::tss_ptr();
            if !tss.is_null() {
                crate::arch::tss::Tss::set_rsp0(tss, new_kstack_top);
            }
            vmm::load(sched.current.as_ref().unwrap().pml4);
        }

        let old_rsp_ptr = if old_is_dead {
            &raw mut DEAD_RSP
        } else {
            &mut sched.tasks.back_mut().unwrap().kernel_rsp as *mut u64
        };
        let new_rsp = sched.current.as_ref().unwrap().kernel_rsp;

        (old_rsp_ptr, new_rsp)
        // MutexGuard dropped here — lock is released before the switch.
    };

    unsafe {
        context_switch_asm(old_rsp_ptr, new_rsp);
        // We may resume here from an interrupt context where IF was
        // cleared; re-enable it so the timer can keep driving preemption.
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

/// Enter the scheduler for the first time, handing the CPU to whichever
/// process `spawn` put on the ready queue first. Never returns: the boot
/// stack's register state is saved into a location nothing ever reads back
/// from, since boot never resumes.
///
/// # Safety
/// Must be called exactly once, after GDT/TSS/IDT and the syscall MSRs are
/// set up, with at least one process already enqueued via `spawn`.
pub unsafe fn start_scheduling() -> ! {
    static mut BOOT_RSP: u64 = 0;

    let new_rsp = {
        let mut sched = SCHEDULER.lock();
        let mut first = sched.tasks.pop_front().expect("start_scheduling: no process queued");
        first.state = ProcessState::Running;
        let new_kstack_top = first.kernel_stack.top();
        let rsp = first.kernel_rsp;
        sched.current = Some(first);

        unsafe {
            core::ptr::write_volatile(
                &raw mut crate::arch::syscall::SYSCALL_KERNEL_RSP,
                new_kstack_top,
            );
            let tss = crate::traps::tss_ptr();
            if !tss.is_null() {
                crate::arch::tss::Tss::set_rsp0(tss, new_kstack_top);
            }
            vmm::load(sched.current.as_ref().unwrap().pml4);
        }

        rsp
    };

    unsafe {
        context_switch_asm(&raw mut BOOT_RSP, new_rsp);
    }
    unreachable!("context_switch_asm cannot return into a retired boot stack");
}

/// Timer tick hook, called from the timer interrupt handler. Drives
/// preemption: decrements the current quantum and reschedules once it
/// runs out.
static QUANTUM_REMAINING: AtomicU64 = AtomicU64::new(config::SCHEDULER_QUANTUM_TICKS);

pub fn on_timer_tick() {
    let previous = QUANTUM_REMAINING.fetch_sub(1, Ordering::Relaxed);
    if previous <= 1 {
        QUANTUM_REMAINING.store(config::SCHEDULER_QUANTUM_TICKS, Ordering::Relaxed);
        unsafe { do_schedule() };
    }
}

// ── Signal delivery ───────────────────────────────────────────────

/// Mirrors the register layout `arch::syscall::syscall_entry` pushes for
/// the user-mode RIP/RFLAGS/RSP it saves across a syscall. Used to rewrite
/// the return path for signal delivery and `SigReturn`.
#[repr(C)]
pub struct SyscallFrame {
    pub user_rsp: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub user_rflags: u64,
    pub user_rip: u64,
}

/// Called by the syscall stub immediately after `syscall_dispatch` returns,
/// before any register is restored. Handles a pending `SigReturn` restore,
/// or redirects the return path into an installed signal handler.
///
/// The reserved 128-byte trampoline frame below the handler's stack holds
/// the delivered signal number at its base, rather than passing it via a
/// register — avoids needing the syscall stub to thread an extra argument
/// register through the restore sequence for a case this rare.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn deliver_pending_signal(frame: *mut SyscallFrame) {
    let mut sched = SCHEDULER.lock();
    let Some(current) = sched.current_mut() else {
        return;
    };
    if !current.valid_user_state_flag {
        return;
    }

    let f = unsafe { &mut *frame };

    if current.sigreturn_pending {
        if let Some(saved) = current.signal_return_frame.take() {
            f.user_rip = saved.rip;
            f.user_rsp = saved.rsp;
        }
        current.sigreturn_pending = false;
        return;
    }

    let Some(sig) = current.take_pending_signal() else {
        return;
    };
    let Some(handler) = current.signal_table[sig as usize] else {
        return;
    };

    current.signal_return_frame = Some(SignalReturnFrame {
        rip: f.user_rip,
        rsp: f.user_rsp,
    });

    let new_rsp = (f.user_rsp - 128) & !0xF;
    unsafe {
        core::ptr::write(new_rsp as *mut u64, sig as u64);
    }
    f.user_rip = handler;
    f.user_rsp = new_rsp;
}

// ── Syscall-facing process operations ────────────────────────────

/// Install a handler for `sig` on the current process. `handler == 0`
/// clears it back to the default disposition.
pub fn set_signal_handler(sig: u8, handler: u64) -> KernelResult<()> {
    if sig as usize >= config::SIGNAL_TABLE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let mut sched = SCHEDULER.lock();
    let current = sched.current_mut().ok_or(KernelError::CorruptState)?;
    current.signal_table[sig as usize] = if handler == 0 { None } else { Some(handler) };
    Ok(())
}

/// Mark the current syscall as a `SigReturn`: the next return-to-user-mode
/// restores the pre-signal RIP/RSP instead of whatever the stub would
/// otherwise restore.
pub fn request_sigreturn() -> KernelResult<()> {
    let mut sched = SCHEDULER.lock();
    let current = sched.current_mut().ok_or(KernelError::CorruptState)?;
    if current.signal_return_frame.is_none() {
        return Err(KernelError::InvalidArgument);
    }
    current.sigreturn_pending = true;
    Ok(())
}

/// Record `sig` as pending for `pid`. Returns `false` if no live process
/// has that PID.
pub fn kill(pid: u64, sig: u8) -> bool {
    let mut sched = SCHEDULER.lock();
    match sched.find_mut(pid) {
        Some(p) => {
            p.raise_signal(sig);
            true
        }
        None => false,
    }
}

/// Current process's PID, or `None` if called outside process context.
pub fn current_pid() -> Option<u64> {
    SCHEDULER.lock().current().map(|p| p.pid)
}

/// Reap a terminated child: pops its zombie record, frees its address
/// space root, and writes back its exit code.
pub fn wait(pid: u64) -> Option<u64> {
    let mut sched = SCHEDULER.lock();
    let zombie = sched.take_zombie(pid)?;
    // Lower-level page tables referenced by this PML4 were never freed
    // individually (vmm::unmap_page doesn't reclaim intermediate tables
    // either) — freeing just the root is the proportionate amount of
    // teardown for a boot-time single-shell workload.
    pmm::free_frame(zombie.pml4);
    Some(zombie.exit_code)
}

/// Terminate the current process with `code`. Never returns: the caller
/// (the `Exit` syscall handler) must immediately reschedule.
pub fn exit_current(code: u64) {
    let mut sched = SCHEDULER.lock();
    if let Some(current) = sched.current_mut() {
        current.state = ProcessState::Terminated;
        current.exit_code = Some(code);
    }
}

/// Put the current process to sleep until `clock::now() >= deadline`.
/// Returns once the deadline passes; busy-polls the timer by yielding the
/// CPU every tick in the meantime (a known simplification — no wait queue
/// backs this, just repeated voluntary rescheduling).
pub fn sleep_until(deadline: u64) {
    while crate::task::clock::now() < deadline {
        unsafe { do_schedule() };
    }
}

// ── Spawn / exec ──────────────────────────────────────────────────

/// Load the ELF executable at `path` from the root VFS into a fresh
/// address space, build its initial stack from `argv`, and enqueue it as a
/// new process. Returns the new PID.
pub fn spawn(path: &str, argv: &[&str], parent_pid: Option<u64>) -> KernelResult<u64> {
    let data = vfs::read_file(vfs::root(), path)?;
    let info = elf::parse(data).map_err(|_| KernelError::InvalidArgument)?;

    let pml4 = vmm::create_user_page_table().ok_or(KernelError::OutOfMemory)?;

    match build_process_image(pml4, &info, argv) {
        Ok((user_rsp, argc, argv_ptr)) => {
            let mut proc = Process::new(path, parent_pid, pml4, info.entry, user_rsp, argc, argv_ptr);
            proc.prepare_initial_stack();
            let pid = proc.pid;

            SCHEDULER.lock().push(proc);
            log::info!("spawned '{}' (pid {}) entry={:#x}", path, pid, info.entry);
            Ok(pid)
        }
        Err(e) => {
            // Unwind whatever got mapped before the failing step — segment
            // frames, page-table frames `get_or_create_next_table` allocated
            // along the way, and the PML4 itself.
            unsafe { vmm::free_user_address_space(pml4) };
            Err(e)
        }
    }
}

/// Maps every `PT_LOAD` segment and builds the initial user stack into
/// `pml4`. Split out of `spawn` so a failure partway through has a single
/// point where the caller can roll the whole address space back.
fn build_process_image(
    pml4: PhysAddr,
    info: &elf::ElfInfo<'_>,
    argv: &[&str],
) -> KernelResult<(u64, u64, u64)> {
    for phdr in info.phdrs {
        if !phdr.is_load() {
            continue;
        }
        map_elf_segment(pml4, info.data, phdr)?;
    }

    setup_user_stack(pml4, argv)
}

fn map_elf_segment(pml4: PhysAddr, data: &[u8], phdr: &elf::Elf64Phdr) -> KernelResult<()> {
    let vaddr = phdr.p_vaddr;
    let memsz = phdr.p_memsz as usize;
    let filesz = phdr.p_filesz as usize;
    let offset = phdr.p_offset as usize;
    let (writable, executable) = elf::segment_flags(phdr.p_flags);

    let page_start = vaddr & !(PAGE_SIZE - 1);
    let page_end = (vaddr + memsz as u64).next_multiple_of(PAGE_SIZE);
    let num_pages = ((page_end - page_start) / PAGE_SIZE) as usize;

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    if !executable {
        flags |= PageTableFlags::NO_EXECUTE;
    }

    for i in 0..num_pages {
        let virt = VirtAddr::new(page_start + i as u64 * PAGE_SIZE);
        let frame = pmm::alloc_frame_zeroed().ok_or(KernelError::OutOfMemory)?;
        unsafe {
            vmm::map_page(pml4, virt, frame, flags).map_err(|_| KernelError::CorruptState)?;
        }
    }

    if filesz > 0 {
        let mut remaining = filesz;
        let mut file_off = offset;
        let mut dest = vaddr;
        while remaining > 0 {
            let page_virt = VirtAddr::new(dest & !(PAGE_SIZE - 1));
            let page_off = (dest - (dest & !(PAGE_SIZE - 1))) as usize;
            let phys = vmm::translate(pml4, page_virt).ok_or(KernelError::CorruptState)?;
            let chunk = (PAGE_SIZE as usize - page_off).min(remaining);
            unsafe {
                let dest_ptr = phys.to_virt().as_mut_ptr::<u8>().add(page_off);
                core::ptr::copy_nonoverlapping(data.as_ptr().add(file_off), dest_ptr, chunk);
            }
            remaining -= chunk;
            file_off += chunk;
            dest += chunk as u64;
        }
    }
    Ok(())
}

/// Map and populate the user stack, writing the argc/argv/string block at
/// the very top per the `Exec` calling convention. Returns
/// `(initial_rsp, argc, argv_ptr)`.
fn setup_user_stack(pml4: PhysAddr, argv: &[&str]) -> KernelResult<(u64, u64, u64)> {
    let num_pages = config::USER_STACK_SIZE as u64 / PAGE_SIZE;
    let stack_bottom = config::USER_STACK_TOP + PAGE_SIZE - config::USER_STACK_SIZE as u64;

    let mut frames = Vec::with_capacity(num_pages as usize);
    for i in 0..num_pages {
        let virt = VirtAddr::new(stack_bottom + i * PAGE_SIZE);
        let frame = pmm::alloc_frame_zeroed().ok_or(KernelError::OutOfMemory)?;
        unsafe {
            vmm::map_page(
                pml4,
                virt,
                frame,
                PageTableFlags::PRESENT
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::USER
                    | PageTableFlags::NO_EXECUTE,
            )
            .map_err(|_| KernelError::CorruptState)?;
        }
        frames.push(frame);
    }

    // Write directly through each frame's HHDM mapping — we already hold
    // the physical frame for every page of this stack from the loop above,
    // so there's no need to switch CR3 to reach it.
    let write_bytes = |virt: u64, data: &[u8]| {
        for (i, &b) in data.iter().enumerate() {
            let addr = virt + i as u64;
            let page_index = ((addr - stack_bottom) / PAGE_SIZE) as usize;
            let offset = (addr % PAGE_SIZE) as usize;
            unsafe {
                frames[page_index].to_virt().as_mut_ptr::<u8>().add(offset).write(b);
            }
        }
    };

    let mut strings_len = 0usize;
    for a in argv {
        strings_len += a.len() + 1;
    }
    let ptrs_len = (argv.len() + 1) * 8;
    let total = 8 + ptrs_len + strings_len;
    let aligned_total = total.next_multiple_of(16) as u64;

    let layout_top = config::USER_STACK_TOP + PAGE_SIZE;
    let base = layout_top - aligned_total;

    write_bytes(base, &(argv.len() as u64).to_le_bytes());

    let strings_start = base + 8 + ptrs_len as u64;
    let mut str_pos = strings_start;
    let mut ptr_values = Vec::with_capacity(argv.len());
    for a in argv {
        ptr_values.push(str_pos);
        write_bytes(str_pos, a.as_bytes());
        write_bytes(str_pos + a.len() as u64, &[0u8]);
        str_pos += a.len() as u64 + 1;
    }

    let mut ptr_cursor = base + 8;
    for p in &ptr_values {
        write_bytes(ptr_cursor, &p.to_le_bytes());
        ptr_cursor += 8;
    }
    write_bytes(ptr_cursor, &0u64.to_le_bytes());

    Ok((base, argv.len() as u64, base + 8))
}
