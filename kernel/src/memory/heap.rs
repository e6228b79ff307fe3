// =============================================================================
// MinimalOS NextGen — Kernel Heap Allocator
// =============================================================================
//
// A single intrusive doubly-linked free list living at a fixed virtual
// base address (`config::KERNEL_HEAP_BASE`), independent of wherever the
// physical memory manager happens to find backing frames. Every block,
// free or allocated, carries a header:
//
//   ┌────────┬──────┬───────┬──────┬──────┐
//   │ size   │ free │ magic │ next │ prev │   ← header (fixed size)
//   ├────────┴──────┴───────┴──────┴──────┤
//   │            payload (≥16B aligned)    │
//   └───────────────────────────────────────┘
//
// `size` covers the header plus payload. `magic` lets `Free` detect a
// double-free or a garbage pointer and ignore it rather than corrupt
// adjacent blocks. First-fit allocation; splits the tail off a block when
// the remainder is large enough to host another header plus 16 bytes of
// payload; on free, merges forward with the next block (using its
// original size) and then backward with the previous block (using the
// already-updated size) — no field is read twice after it changes meaning.
//
// When no free block fits, the heap grows by mapping more pages at its
// current end via the virtual memory manager, rather than failing outright.
// =============================================================================

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::config;
use crate::kprintln;
use crate::memory::address::{VirtAddr, PAGE_SIZE};
use crate::memory::pmm;
use crate::memory::vmm::{self, PageTableFlags};
use crate::sync::spinlock::SpinLock;

const HEAP_MAGIC: usize = 0x1248ACE0;
const ALIGNMENT: usize = 16;

#[repr(C)]
struct BlockHeader {
    size: usize,
    free: bool,
    magic: usize,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

const HEADER_SIZE: usize = align_up(core::mem::size_of::<BlockHeader>(), ALIGNMENT);

struct Heap {
    start: usize,
    end: usize,
    first_block: *mut BlockHeader,
    total: usize,
    used: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    const fn new() -> Self {
        Self { start: 0, end: 0, first_block: ptr::null_mut(), total: 0, used: 0 }
    }

    fn init(&mut self, start: usize, size: usize) {
        self.start = start;
        self.end = start;
        self.first_block = ptr::null_mut();
        self.total = 0;
        self.used = 0;
        self.grow(size);
    }

    /// Maps at least `min_bytes` more, rounded up to whole pages, at the
    /// current heap end, and folds the new space in as a free block
    /// (coalescing with the previous tail block if it's free).
    fn grow(&mut self, min_bytes: usize) -> bool {
        let pages = (min_bytes as u64).div_ceil(PAGE_SIZE).max(1);
        let grow_start = self.end;
        let pml4 = vmm::active_pml4();

        for i in 0..pages {
            let frame = match pmm::alloc_frame_zeroed() {
                Some(f) => f,
                None => return false,
            };
            let virt = VirtAddr::new(grow_start as u64 + i * PAGE_SIZE);
            // SAFETY: `virt` is within the heap's private region, not yet
            // mapped, and `frame` was just allocated fresh.
            let mapped = unsafe {
                vmm::map_page(pml4, virt, frame, PageTableFlags::KERNEL_DATA)
            };
            if mapped.is_err() {
                pmm::free_frame(frame);
                return false;
            }
            vmm::flush(virt);
        }

        let grown_bytes = (pages * PAGE_SIZE) as usize;
        self.end += grown_bytes;
        self.total += grown_bytes;

        let new_block = grow_start as *mut BlockHeader;
        // SAFETY: `new_block` is freshly mapped, zeroed, writable memory.
        unsafe {
            new_block.write(BlockHeader {
                size: grown_bytes,
                free: true,
                magic: HEAP_MAGIC,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
            });
        }

        if self.first_block.is_null() {
            self.first_block = new_block;
            return true;
        }

        // Find the current tail.
        let mut tail = self.first_block;
        unsafe {
            while !(*tail).next.is_null() {
                tail = (*tail).next;
            }
        }

        let tail_free = unsafe { (*tail).free };
        if tail_free {
            // The new block is exactly adjacent to the old tail (heap grows
            // contiguously) — merge instead of appending a second node.
            unsafe {
                (*tail).size += (*new_block).size;
            }
        } else {
            unsafe {
                (*tail).next = new_block;
                (*new_block).prev = tail;
            }
        }
        true
    }

    fn allocate(&mut self, payload: usize) -> *mut u8 {
        let payload = align_up(payload.max(ALIGNMENT), ALIGNMENT);

        loop {
            let mut cur = self.first_block;
            while !cur.is_null() {
                let hdr = unsafe { &mut *cur };
                if hdr.free && hdr.size >= HEADER_SIZE + payload {
                    return self.use_block(cur, payload);
                }
                cur = hdr.next;
            }
            if !self.grow(payload + HEADER_SIZE) {
                return ptr::null_mut();
            }
        }
    }

    fn use_block(&mut self, block: *mut BlockHeader, payload: usize) -> *mut u8 {
        let hdr = unsafe { &mut *block };
        let block_total = hdr.size;
        let used_total = HEADER_SIZE + payload;
        let remainder = block_total - used_total;

        if remainder >= HEADER_SIZE + ALIGNMENT {
            let split_addr = block as usize + used_total;
            hdr.size = used_total;
            let split = split_addr as *mut BlockHeader;
            unsafe {
                split.write(BlockHeader {
                    size: remainder,
                    free: true,
                    magic: HEAP_MAGIC,
                    next: hdr.next,
                    prev: block,
                });
                if !hdr.next.is_null() {
                    (*hdr.next).prev = split;
                }
                hdr.next = split;
            }
        }

        hdr.free = false;
        hdr.magic = HEAP_MAGIC;
        self.used += hdr.size;
        (block as usize + HEADER_SIZE) as *mut u8
    }

    fn free(&mut self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let addr = p as usize;
        if addr < self.start + HEADER_SIZE || addr > self.end {
            return; // not a pointer we handed out — ignore silently
        }
        let block = (addr - HEADER_SIZE) as *mut BlockHeader;
        let hdr = unsafe { &mut *block };
        if hdr.magic != HEAP_MAGIC || hdr.free {
            return; // double-free or corrupt pointer — ignore silently
        }

        self.used -= hdr.size;
        hdr.free = true;
        self.coalesce(block);
    }

    /// Merge forward with `next` first (using `block`'s original size),
    /// then merge backward with `prev` using the size already updated by
    /// the forward step — never re-reading a field after its meaning
    /// changed within this call.
    fn coalesce(&mut self, block: *mut BlockHeader) {
        unsafe {
            let hdr = &mut *block;
            if !hdr.next.is_null() && (*hdr.next).free {
                let next = hdr.next;
                hdr.size += (*next).size;
                hdr.next = (*next).next;
                if !hdr.next.is_null() {
                    (*hdr.next).prev = block;
                }
            }

            let hdr = &mut *block;
            if !hdr.prev.is_null() && (*hdr.prev).free {
                let prev = hdr.prev;
                (*prev).size += hdr.size;
                (*prev).next = hdr.next;
                if !hdr.next.is_null() {
                    (*hdr.next).prev = prev;
                }
            }
        }
    }

    fn allocate_aligned(&mut self, n: usize, align: usize) -> *mut u8 {
        let align = align.max(ALIGNMENT);
        let raw = self.allocate(n + align + core::mem::size_of::<usize>());
        if raw.is_null() {
            return ptr::null_mut();
        }
        let after_tag = raw as usize + core::mem::size_of::<usize>();
        let aligned = align_up(after_tag, align);
        unsafe {
            ((aligned - core::mem::size_of::<usize>()) as *mut usize).write(raw as usize);
        }
        aligned as *mut u8
    }

    fn free_aligned(&mut self, aligned: *mut u8) {
        if aligned.is_null() {
            return;
        }
        let tag_addr = aligned as usize - core::mem::size_of::<usize>();
        let raw = unsafe { (tag_addr as *const usize).read() } as *mut u8;
        self.free(raw);
    }

    fn reallocate(&mut self, p: *mut u8, new_size: usize) -> *mut u8 {
        if p.is_null() {
            return self.allocate(new_size);
        }
        let block = (p as usize - HEADER_SIZE) as *mut BlockHeader;
        let hdr = unsafe { &*block };
        if hdr.magic != HEAP_MAGIC || hdr.free {
            return ptr::null_mut();
        }
        let current_payload = hdr.size - HEADER_SIZE;
        let wanted = align_up(new_size.max(ALIGNMENT), ALIGNMENT);
        if current_payload >= wanted {
            return p;
        }
        let new_ptr = self.allocate(new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::copy_nonoverlapping(p, new_ptr, current_payload.min(new_size));
        }
        self.free(p);
        new_ptr
    }
}

// =============================================================================
// Global allocator
// =============================================================================

pub struct KernelAllocator {
    inner: SpinLock<Heap>,
}

impl KernelAllocator {
    const fn new() -> Self {
        Self { inner: SpinLock::new(Heap::new()) }
    }
}

/// SAFETY: the SpinLock serializes every access to the Heap internals.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            self.inner.lock().allocate(layout.size())
        } else {
            self.inner.lock().allocate_aligned(layout.size(), layout.align())
        }
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        if layout.align() <= ALIGNMENT {
            self.inner.lock().free(p);
        } else {
            self.inner.lock().free_aligned(p);
        }
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator::new();

// =============================================================================
// Public API
// =============================================================================

/// Allocates `n` bytes, 16-byte aligned. Returns null on exhaustion.
pub fn allocate(n: usize) -> *mut u8 {
    ALLOCATOR.inner.lock().allocate(n)
}

/// Frees a pointer previously returned by `allocate`. Silently ignores a
/// double-free or a pointer this heap never handed out.
pub fn free(p: *mut u8) {
    ALLOCATOR.inner.lock().free(p);
}

/// Allocates `n` bytes aligned to `align` (which may exceed 16).
pub fn allocate_aligned(n: usize, align: usize) -> *mut u8 {
    ALLOCATOR.inner.lock().allocate_aligned(n, align)
}

/// Frees a pointer previously returned by `allocate_aligned`.
pub fn free_aligned(p: *mut u8) {
    ALLOCATOR.inner.lock().free_aligned(p);
}

/// Resizes an allocation in place if it already fits, otherwise allocates,
/// copies, and frees the original.
pub fn reallocate(p: *mut u8, new_size: usize) -> *mut u8 {
    ALLOCATOR.inner.lock().reallocate(p, new_size)
}

/// Initializes the kernel heap at its fixed virtual base address.
///
/// # Prerequisites
/// PMM must be initialized and a page-table manager with the current
/// address space active (`vmm::active_pml4()` must return a usable PML4).
pub fn init() {
    ALLOCATOR
        .inner
        .lock()
        .init(config::KERNEL_HEAP_BASE as usize, config::KERNEL_HEAP_INITIAL_SIZE as usize);
    kprintln!(
        "[heap] Kernel heap initialized at {:#018X} ({} KiB)",
        config::KERNEL_HEAP_BASE,
        config::KERNEL_HEAP_INITIAL_SIZE / 1024
    );
}

pub fn allocated_bytes() -> usize {
    ALLOCATOR.inner.lock().used
}

pub fn total_bytes() -> usize {
    ALLOCATOR.inner.lock().total
}

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("Kernel heap allocation failed: size={}, align={}", layout.size(), layout.align());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_16_byte_aligned() {
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
    }
}
