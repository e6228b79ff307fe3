// =============================================================================
// MinimalOS NextGen — Physical Memory Manager (Bitmap Frame Allocator)
// =============================================================================
//
// The PMM tracks which physical page frames (4 KiB each) are free or in use,
// one bit per frame (1 = used, 0 = free), via the `Bitmap` type in
// `memory::bitmap`.
//
// INITIALIZATION ALGORITHM (3-pass over the Limine memory map):
//   Pass 1: Scan entries to find the highest physical address that needs
//           tracking. This sizes the bitmap.
//   Pass 2: Find a USABLE region large enough to hold the bitmap itself,
//           placed there and accessed via HHDM.
//   Pass 3: Mark every frame used, then clear the bits for USABLE regions,
//           then re-mark the bitmap's own frames and frame 0 as used.
//
// Everything that survives pass 3 unaccounted for — BOOTLOADER_RECLAIMABLE,
// ACPI, framebuffer, kernel image — stays allocated. The caller never
// frees frames the allocator didn't explicitly hand out.
//
// THREAD SAFETY: the global PMM state is protected by a ticket spinlock, as
// there is no SMP to race against, only reentrancy from an interrupt handler
// running on the same core — callers must not hold the lock across an IRQ.
// =============================================================================

use core::ptr;

use crate::kprintln;
use crate::memory::address::{PhysAddr, PAGE_SIZE};
use crate::memory::bitmap::Bitmap;
use crate::sync::spinlock::SpinLock;

/// Snapshot of physical memory usage statistics.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub bitmap_bytes: usize,
}

/// The global physical memory manager, protected by a ticket spinlock.
///
/// `None` before `init()` is called. All public functions panic if the
/// PMM is not yet initialized — these represent a programming error in the
/// boot sequence, not a runtime condition a caller can recover from.
static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

struct BitmapAllocator {
    bitmap: Bitmap<'static>,
    bitmap_bytes: usize,
    bitmap_phys: PhysAddr,
    bitmap_frame_count: usize,
    total_frames: usize,
    used_frames: usize,
}

unsafe impl Send for BitmapAllocator {}

impl BitmapAllocator {
    fn new(memory_map: &[&limine::memory_map::Entry]) -> Self {
        // Pass 1: highest address worth tracking.
        let mut highest_addr: u64 = 0;
        for entry in memory_map {
            let dominated = matches!(
                entry.entry_type,
                limine::memory_map::EntryType::USABLE
                    | limine::memory_map::EntryType::BOOTLOADER_RECLAIMABLE
                    | limine::memory_map::EntryType::ACPI_RECLAIMABLE
                    | limine::memory_map::EntryType::EXECUTABLE_AND_MODULES
                    | limine::memory_map::EntryType::FRAMEBUFFER
            );
            if dominated {
                let end = entry.base + entry.length;
                if end > highest_addr {
                    highest_addr = end;
                }
            }
        }

        let total_frames = (highest_addr / PAGE_SIZE) as usize;
        let bitmap_bytes = total_frames.div_ceil(8);
        let bitmap_words = bitmap_bytes.div_ceil(8);
        let bitmap_frame_count =
            (bitmap_words * 8).div_ceil(PAGE_SIZE as usize);

        kprintln!(
            "[pmm] Highest physical address: {:#012X} ({} MiB)",
            highest_addr,
            highest_addr / 1024 / 1024
        );
        kprintln!(
            "[pmm] Tracking {} frames, bitmap = {} bytes ({} pages)",
            total_frames,
            bitmap_bytes,
            bitmap_frame_count
        );

        // Pass 2: find a USABLE region to hold the bitmap. Skip region base 0
        // so the bitmap never overlaps the reserved null frame.
        let mut bitmap_phys: Option<PhysAddr> = None;
        for entry in memory_map {
            if entry.entry_type == limine::memory_map::EntryType::USABLE
                && entry.length >= (bitmap_frame_count as u64 * PAGE_SIZE)
                && entry.base > 0
            {
                bitmap_phys = Some(PhysAddr::new(entry.base));
                break;
            }
        }
        let bitmap_phys = bitmap_phys.expect("PMM: no usable region large enough for bitmap");

        kprintln!("[pmm] Bitmap placed at physical {}", bitmap_phys);

        let bitmap_ptr = bitmap_phys.to_virt().as_mut_ptr::<u64>();
        // SAFETY: `bitmap_ptr` points to `bitmap_words * 8` bytes of valid
        // physical memory, mapped through the HHDM, not yet referenced by
        // anyone else (single-core boot, before this allocator is published).
        let words: &'static mut [u64] =
            unsafe { core::slice::from_raw_parts_mut(bitmap_ptr, bitmap_words) };

        let mut bitmap = Bitmap::new(words, total_frames);
        bitmap.set_all();
        let mut used_frames = total_frames;

        // Pass 3: free USABLE regions.
        for entry in memory_map {
            if entry.entry_type == limine::memory_map::EntryType::USABLE {
                let start_frame = (entry.base / PAGE_SIZE) as usize;
                let end_frame = ((entry.base + entry.length) / PAGE_SIZE) as usize;
                let end_frame = end_frame.min(total_frames);
                if start_frame >= end_frame {
                    continue;
                }
                let before = count_free(&bitmap, start_frame, end_frame);
                bitmap.clear_range(start_frame, end_frame - start_frame);
                let after = end_frame - start_frame;
                used_frames -= after - before;
            }
        }

        // Re-reserve the bitmap's own backing frames and the null frame.
        let bitmap_start_frame = (bitmap_phys.as_u64() / PAGE_SIZE) as usize;
        for frame in bitmap_start_frame..bitmap_start_frame + bitmap_frame_count {
            if !bitmap.get(frame) {
                bitmap.set(frame);
                used_frames += 1;
            }
        }
        if !bitmap.get(0) {
            bitmap.set(0);
            used_frames += 1;
        }

        kprintln!(
            "[pmm] Free frames: {} ({} MiB), used: {} ({} MiB)",
            total_frames - used_frames,
            (total_frames - used_frames) as u64 * PAGE_SIZE / 1024 / 1024,
            used_frames,
            used_frames as u64 * PAGE_SIZE / 1024 / 1024,
        );

        Self {
            bitmap,
            bitmap_bytes,
            bitmap_phys,
            bitmap_frame_count,
            total_frames,
            used_frames,
        }
    }

    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let frame = self.bitmap.find_first_zero()?;
        self.bitmap.set(frame);
        self.used_frames += 1;
        Some(PhysAddr::new(frame as u64 * PAGE_SIZE))
    }

    fn alloc_frame_zeroed(&mut self) -> Option<PhysAddr> {
        let frame = self.alloc_frame()?;
        // SAFETY: `frame` is a frame this allocator just handed out, valid
        // physical memory reachable through the HHDM.
        unsafe {
            ptr::write_bytes(frame.to_virt().as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        Some(frame)
    }

    fn free_frame(&mut self, addr: PhysAddr) {
        assert!(addr.is_page_aligned(), "PMM: cannot free unaligned address {}", addr);
        let frame_idx = (addr.as_u64() / PAGE_SIZE) as usize;
        assert!(
            frame_idx < self.total_frames,
            "PMM: frame index {} out of range (max {})",
            frame_idx,
            self.total_frames
        );
        assert!(
            self.bitmap.get(frame_idx),
            "PMM: double free detected at frame {} ({})",
            frame_idx,
            addr
        );
        self.bitmap.clear(frame_idx);
        self.used_frames -= 1;
    }

    fn alloc_contiguous(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let start = self.bitmap.find_first_zero_run(count)?;
        self.bitmap.set_range(start, count);
        self.used_frames += count;
        Some(PhysAddr::new(start as u64 * PAGE_SIZE))
    }

    /// Marks a single frame as permanently used without requiring it to have
    /// been handed out by `alloc_frame` first — used to keep reclaimable or
    /// MMIO regions out of the free set.
    fn reserve_frame(&mut self, addr: PhysAddr) {
        let frame_idx = (addr.page_align_down().as_u64() / PAGE_SIZE) as usize;
        if frame_idx >= self.total_frames {
            return;
        }
        if !self.bitmap.get(frame_idx) {
            self.bitmap.set(frame_idx);
            self.used_frames += 1;
        }
    }

    fn reserve_frames(&mut self, addr: PhysAddr, count: usize) {
        let start_frame = (addr.page_align_down().as_u64() / PAGE_SIZE) as usize;
        for frame in start_frame..(start_frame + count).min(self.total_frames) {
            if !self.bitmap.get(frame) {
                self.bitmap.set(frame);
                self.used_frames += 1;
            }
        }
    }

    fn reserve_region(&mut self, base: PhysAddr, len: u64) {
        if len == 0 {
            return;
        }
        let start = base.page_align_down().as_u64();
        let end = (base.as_u64() + len).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let count = ((end - start) / PAGE_SIZE) as usize;
        self.reserve_frames(PhysAddr::new(start), count);
    }

    fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames,
            used_frames: self.used_frames,
            free_frames: self.total_frames - self.used_frames,
            bitmap_bytes: self.bitmap_bytes,
        }
    }
}

fn count_free(bitmap: &Bitmap<'static>, start: usize, end: usize) -> usize {
    let mut n = 0;
    for i in start..end {
        if !bitmap.get(i) {
            n += 1;
        }
    }
    n
}

// =============================================================================
// Public API — module-level functions that acquire the spinlock
// =============================================================================

/// Initializes the physical memory manager from the Limine memory map.
/// Must be called exactly once during early boot.
pub fn init(memory_map: &[&limine::memory_map::Entry]) {
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM: init called more than once");
    *pmm = Some(BitmapAllocator::new(memory_map));
}

fn with_pmm<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    f(PMM.lock().as_mut().expect("PMM: not initialized — call pmm::init() first"))
}

/// Allocates a single 4 KiB physical frame. Contents are uninitialized.
pub fn alloc_frame() -> Option<PhysAddr> {
    with_pmm(|a| a.alloc_frame())
}

/// Allocates a single 4 KiB physical frame, zeroed.
pub fn alloc_frame_zeroed() -> Option<PhysAddr> {
    with_pmm(|a| a.alloc_frame_zeroed())
}

/// Allocates `count` physically contiguous frames.
pub fn alloc_frames(count: usize) -> Option<PhysAddr> {
    with_pmm(|a| a.alloc_contiguous(count))
}

/// Frees a single previously allocated physical frame.
pub fn free_frame(addr: PhysAddr) {
    with_pmm(|a| a.free_frame(addr));
}

/// Frees `count` physically contiguous frames previously returned together
/// by `alloc_frames`.
pub fn free_frames(addr: PhysAddr, count: usize) {
    with_pmm(|a| {
        for i in 0..count {
            a.free_frame(PhysAddr::new(addr.as_u64() + i as u64 * PAGE_SIZE));
        }
    });
}

/// Marks a single frame as permanently used, outside the normal
/// alloc/free accounting. Used to keep bootloader-reclaimable or MMIO
/// regions out of the free set.
pub fn reserve_frame(addr: PhysAddr) {
    with_pmm(|a| a.reserve_frame(addr));
}

/// Marks `count` contiguous frames starting at `addr` as permanently used.
pub fn reserve_frames(addr: PhysAddr, count: usize) {
    with_pmm(|a| a.reserve_frames(addr, count));
}

/// Marks every frame overlapping the byte range `[base, base + len)` as
/// permanently used, rounding outward to page boundaries.
pub fn reserve_region(base: PhysAddr, len: u64) {
    with_pmm(|a| a.reserve_region(base, len));
}

/// Returns a snapshot of current physical memory statistics.
pub fn stats() -> MemoryStats {
    with_pmm(|a| a.stats())
}
