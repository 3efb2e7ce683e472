//! Kernel heap.
//!
//! First-fit free-list allocator over a fixed region of the kernel
//! direct-mapped area. The free list is kept sorted by address so freed
//! blocks can coalesce with their neighbors.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;
use spin::Mutex;

/// Heap region inside kernel memory (direct-mapped, below user space).
pub const HEAP_START: usize = 0x0080_0000;
pub const HEAP_SIZE: usize = 0x0080_0000;

const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

/// Header written at the start of every free region.
#[repr(C)]
struct FreeBlock {
    /// Total bytes in this block, header included.
    size: usize,
    next: *mut FreeBlock,
}

struct Heap {
    free_list: *mut FreeBlock,
    start: usize,
    end: usize,
}

unsafe impl Send for Heap {}

impl Heap {
    const fn empty() -> Heap {
        Heap {
            free_list: ptr::null_mut(),
            start: 0,
            end: 0,
        }
    }

    unsafe fn init(&mut self, start: usize, size: usize) {
        let block = start as *mut FreeBlock;
        (*block).size = size;
        (*block).next = ptr::null_mut();
        self.free_list = block;
        self.start = start;
        self.end = start + size;
    }

    unsafe fn allocate(&mut self, layout: Layout) -> *mut u8 {
        let align = layout.align().max(mem::align_of::<FreeBlock>());
        let size = layout.size().max(MIN_BLOCK_SIZE);

        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;
        while !current.is_null() {
            let block_start = current as usize;
            let block_end = block_start + (*current).size;
            let payload = align_up(block_start, align);

            // Front padding must either vanish or be big enough to stay a
            // free block of its own.
            let payload = if payload == block_start || payload - block_start >= MIN_BLOCK_SIZE {
                payload
            } else {
                align_up(block_start + MIN_BLOCK_SIZE, align)
            };

            if payload + size <= block_end {
                self.unlink(prev, current);
                if payload > block_start {
                    self.insert(block_start, payload - block_start);
                }
                let tail = block_end - (payload + size);
                if tail >= MIN_BLOCK_SIZE {
                    self.insert(payload + size, tail);
                    return payload as *mut u8;
                }
                // tail too small to track, hand it out with the allocation
                return payload as *mut u8;
            }
            prev = current;
            current = (*current).next;
        }
        ptr::null_mut()
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8, layout: Layout) {
        let size = layout.size().max(MIN_BLOCK_SIZE);
        self.insert(ptr as usize, size);
    }

    unsafe fn unlink(&mut self, prev: *mut FreeBlock, block: *mut FreeBlock) {
        if prev.is_null() {
            self.free_list = (*block).next;
        } else {
            (*prev).next = (*block).next;
        }
    }

    /// Insert a free region, keeping the list address-sorted and merging
    /// with adjacent neighbors.
    unsafe fn insert(&mut self, start: usize, size: usize) {
        let mut prev: *mut FreeBlock = ptr::null_mut();
        let mut current = self.free_list;
        while !current.is_null() && (current as usize) < start {
            prev = current;
            current = (*current).next;
        }

        let block = start as *mut FreeBlock;
        (*block).size = size;
        (*block).next = current;
        if prev.is_null() {
            self.free_list = block;
        } else {
            (*prev).next = block;
        }

        // merge forward, then backward
        if !current.is_null() && start + size == current as usize {
            (*block).size += (*current).size;
            (*block).next = (*current).next;
        }
        if !prev.is_null() && prev as usize + (*prev).size == start {
            (*prev).size += (*block).size;
            (*prev).next = (*block).next;
        }
    }
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

pub struct LockedHeap(Mutex<Heap>);

impl LockedHeap {
    /// Run `f` with the heap locked and interrupts masked.
    ///
    /// Scheduler paths allocate while the scheduler lock has interrupts
    /// off; if a preempted thread could be holding the heap lock, those
    /// paths would spin forever. Masking interrupts for the (short) heap
    /// critical section means the lock is never held across a preemption,
    /// so on a single CPU it is never actually contended.
    unsafe fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        let flags = crate::arch::get_eflags();
        crate::arch::disable_interrupts();
        let result = f(&mut self.0.lock());
        if flags & crate::arch::eflags::IF != 0 {
            crate::arch::enable_interrupts();
        }
        result
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_heap(|heap| unsafe { heap.allocate(layout) })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.with_heap(|heap| unsafe { heap.deallocate(ptr, layout) });
    }
}

#[cfg_attr(not(test), global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap(Mutex::new(Heap::empty()));

pub fn init() {
    unsafe {
        ALLOCATOR.0.lock().init(HEAP_START, HEAP_SIZE);
    }
    crate::log_info!(
        "Kernel heap at {:#x}..{:#x}",
        HEAP_START,
        HEAP_START + HEAP_SIZE
    );
}
