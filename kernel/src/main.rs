//! MinimalOS NextGen kernel entry point.
//!
//! Boot sequence: bring up the physical/virtual memory subsystem off the
//! Limine memory map, install the kernel heap, wire GDT/TSS/IDT and the
//! `syscall` MSRs, mount the boot-module root filesystem, spawn the shell,
//! and hand the CPU to the scheduler. `_start` never returns.

#![no_std]
#![no_main]
#![feature(abi_x86_interrupt)]
#![feature(alloc_error_handler)]

extern crate alloc;

mod arch;
mod config;
mod error;
mod fs;
mod memory;
mod sync;
mod task;
mod traps;
mod util;

/// Path of the boot module holding the root filesystem tar archive.
const ROOT_FS_MODULE: &str = "/initrd.tar";

/// The first program the kernel runs, loaded out of the root filesystem.
const INIT_PROGRAM: &str = "/shell.elf";

/// Kernel entry point called by the Limine bootloader.
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    assert!(
        arch::boot::is_base_revision_supported(),
        "unsupported Limine base revision"
    );

    unsafe {
        memory::address::init_hhdm(arch::boot::get_hhdm_offset());
    }

    memory::pmm::init(arch::boot::get_memory_map());
    memory::heap::init();

    util::logger::init();
    log::info!("MinimalOS NextGen kernel booting");

    traps::init_idt();
    unsafe {
        arch::syscall::init(arch::tss::Tss::kernel_rsp0());
    }

    let archive = arch::boot::get_module(ROOT_FS_MODULE)
        .unwrap_or_else(|| panic!("boot module '{}' not found", ROOT_FS_MODULE));
    fs::vfs::init_root_vfs(archive);

    match task::process::spawn(INIT_PROGRAM, &[INIT_PROGRAM], None) {
        Ok(pid) => log::info!("spawned init process '{}' (pid {})", INIT_PROGRAM, pid),
        Err(e) => panic!("failed to spawn '{}': {}", INIT_PROGRAM, e),
    }

    unsafe {
        task::process::start_scheduling();
    }
}
