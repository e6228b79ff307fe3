//! Minimal virtual filesystem contract.
//!
//! The ELF loader and `Exec` syscall read files through this narrow trait
//! rather than calling into a concrete filesystem directly. The contract is
//! exactly `open/read/stat/close`; a real deployment backs it with a FAT32
//! volume over AHCI, neither of which are part of this core. The boot-time
//! implementation here reads a USTAR archive out of a Limine module instead,
//! just enough to find and load `/shell.elf`.

use spin::Once;

use crate::error::{KernelError, KernelResult};
use crate::fs::tar;

/// Metadata about a file, as returned by `Vfs::stat`.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: usize,
}

/// A narrow file-access contract the ELF loader and syscall dispatcher call
/// through. Implementations own however they actually find bytes for a path.
pub trait Vfs {
    /// Opens `path`, returning an opaque handle.
    fn open(&self, path: &str) -> KernelResult<VfsHandle>;
    /// Reads the full contents addressed by `handle`.
    fn read(&self, handle: VfsHandle) -> KernelResult<&'static [u8]>;
    /// Returns metadata for `handle` without copying its contents.
    fn stat(&self, handle: VfsHandle) -> KernelResult<FileStat>;
    /// Closes `handle`. A no-op for read-only, non-refcounted backings.
    fn close(&self, handle: VfsHandle);
}

/// An opaque handle returned by `Vfs::open`. For the tar-backed VFS this is
/// just the byte offset of the entry's data within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsHandle(usize);

/// Reads files out of a USTAR archive supplied as a Limine boot module.
///
/// Grounded in the reference kernel's ramdisk+tar combination, but without a
/// dependency on a separate HAL crate: the module's bytes are Limine-mapped
/// already, so no HHDM translation or ramdisk wrapper type is needed.
pub struct TarVfs {
    archive: &'static [u8],
}

impl TarVfs {
    pub const fn new(archive: &'static [u8]) -> Self {
        Self { archive }
    }
}

impl Vfs for TarVfs {
    fn open(&self, path: &str) -> KernelResult<VfsHandle> {
        let entry = tar::find_file(self.archive, path).ok_or(KernelError::NotFound)?;
        let data_offset = entry.data.as_ptr() as usize - self.archive.as_ptr() as usize;
        Ok(VfsHandle(data_offset))
    }

    fn read(&self, handle: VfsHandle) -> KernelResult<&'static [u8]> {
        // Re-walk the archive to recover the entry's length; the handle only
        // encodes where the data starts, not how long it is.
        let name = find_name_at_offset(self.archive, handle.0).ok_or(KernelError::CorruptState)?;
        let entry = tar::find_file(self.archive, name).ok_or(KernelError::NotFound)?;
        // SAFETY: the archive itself is `'static` (backed by a boot module
        // that lives for the kernel's lifetime), so slices borrowed from it
        // may soundly be reborrowed as `'static`.
        let data: &'static [u8] = unsafe { core::slice::from_raw_parts(entry.data.as_ptr(), entry.data.len()) };
        Ok(data)
    }

    fn stat(&self, handle: VfsHandle) -> KernelResult<FileStat> {
        let name = find_name_at_offset(self.archive, handle.0).ok_or(KernelError::CorruptState)?;
        let entry = tar::find_file(self.archive, name).ok_or(KernelError::NotFound)?;
        Ok(FileStat { size: entry.size })
    }

    fn close(&self, _handle: VfsHandle) {}
}

fn find_name_at_offset<'a>(archive: &'a [u8], data_offset: usize) -> Option<&'a str> {
    tar::TarIter::new(archive)
        .find(|entry| entry.data.as_ptr() as usize - archive.as_ptr() as usize == data_offset)
        .map(|entry| entry.name)
}

/// Convenience wrapper for the common "read a whole file by path" case used
/// by the ELF loader: open, read, close in one call.
pub fn read_file(vfs: &dyn Vfs, path: &str) -> KernelResult<&'static [u8]> {
    let handle = vfs.open(path)?;
    let data = vfs.read(handle);
    vfs.close(handle);
    data
}

static ROOT_VFS: Once<TarVfs> = Once::new();

/// Installs the boot module's tar archive as the root filesystem.
///
/// Must be called exactly once, early in boot, before the first `spawn`.
pub fn init_root_vfs(archive: &'static [u8]) {
    ROOT_VFS.call_once(|| TarVfs::new(archive));
}

/// The root filesystem, as installed by `init_root_vfs`.
///
/// Panics if called before `init_root_vfs` — every caller runs after boot
/// has mounted the root archive, so this is a programming error, not a
/// runtime condition to recover from.
pub fn root() -> &'static dyn Vfs {
    ROOT_VFS.get().expect("root vfs not initialized")
}
