//! Filesystem contracts and the boot-time root filesystem reader.
//!
//! `elf` parses ELF64 executables; `tar`/`vfs` together read files out of
//! the boot module that stands in for the FAT32 volume this core treats as
//! an external collaborator (see `vfs::Vfs`).

pub mod elf;
pub mod tar;
pub mod vfs;
