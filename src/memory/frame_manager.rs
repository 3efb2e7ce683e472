//! Physical frame manager: a binary buddy allocator.
//!
//! The manager owns every physical page in `[USER_MEM_START, machine_end)`.
//! Free frames of `2^k` pages sit in bin `k`; allocating a size with an
//! empty bin splits the next bin up, and the two halves keep a buddy link so
//! deallocation can coalesce them back eagerly. Split frames persist in a
//! parent index so coalescing can climb several levels.
//!
//! Frames live in an arena and refer to each other by index, so the
//! parent/buddy graph is plain data rather than a pointer cycle. Three maps
//! index frames by base address: `allocated`, `deallocated`, and `parents`.
//! A parent shares its base with its left child, so the parent key mixes the
//! bin number into the low (always zero) address bits.

use crate::errors::{KernError, KernResult};
use crate::memory::{PAGE_SHIFT, PAGE_SIZE, USER_MEM_START};
use crate::sync::KMutex;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

/// Bins 0..NUM_BINS hold runs of 2^k pages; the largest run is 4 MiB.
pub const NUM_BINS: usize = 11;

pub type FrameId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameStatus {
    Allocated,
    Deallocated,
    Parent,
}

#[derive(Debug)]
struct Frame {
    addr: u32,
    num_pages: u32,
    status: FrameStatus,
    bin: usize,
    buddy: Option<FrameId>,
    parent: Option<FrameId>,
}

/// Slot arena for frames. Freed slots are recycled.
#[derive(Default)]
struct FrameArena {
    slots: Vec<Option<Frame>>,
    free_slots: Vec<FrameId>,
}

impl FrameArena {
    fn insert(&mut self, frame: Frame) -> FrameId {
        match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(frame);
                id
            }
            None => {
                self.slots.push(Some(frame));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, id: FrameId) -> Frame {
        let frame = self.slots[id].take().expect("frame arena slot already free");
        self.free_slots.push(id);
        frame
    }

    fn get(&self, id: FrameId) -> &Frame {
        self.slots[id].as_ref().expect("stale frame id")
    }

    fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        self.slots[id].as_mut().expect("stale frame id")
    }
}

struct FmState {
    arena: FrameArena,
    allocated: BTreeMap<u32, FrameId>,
    deallocated: BTreeMap<u32, FrameId>,
    /// Keyed by `addr | bin`; see module docs.
    parents: BTreeMap<u32, FrameId>,
    bins: Vec<VecDeque<FrameId>>,
}

pub struct FrameManager {
    state: KMutex<FmState>,
}

fn parent_key(addr: u32, bin: usize) -> u32 {
    addr | bin as u32
}

impl FmState {
    fn unlink_from_bin(&mut self, bin: usize, id: FrameId) {
        if let Some(pos) = self.bins[bin].iter().position(|&x| x == id) {
            self.bins[bin].remove(pos);
        } else {
            panic!("frame missing from its bin");
        }
    }

    /// Split one frame of size `2^i` into two buddies of size `2^(i-1)`,
    /// splitting recursively upward if bin `i` is empty.
    fn split(&mut self, i: usize) -> KernResult<()> {
        if i == 0 || i >= NUM_BINS {
            return Err(KernError::NoMemory);
        }
        if self.bins[i].is_empty() {
            self.split(i + 1)?;
        }

        let parent_id = self.bins[i].pop_front().expect("split left bin empty");
        let (addr, half_pages) = {
            let parent = self.arena.get_mut(parent_id);
            debug_assert_eq!(parent.status, FrameStatus::Deallocated);
            parent.status = FrameStatus::Parent;
            (parent.addr, parent.num_pages / 2)
        };
        self.deallocated.remove(&addr);
        self.parents.insert(parent_key(addr, i), parent_id);

        let left_id = self.arena.insert(Frame {
            addr,
            num_pages: half_pages,
            status: FrameStatus::Deallocated,
            bin: i - 1,
            buddy: None,
            parent: Some(parent_id),
        });
        let right_id = self.arena.insert(Frame {
            addr: addr + half_pages * PAGE_SIZE as u32,
            num_pages: half_pages,
            status: FrameStatus::Deallocated,
            bin: i - 1,
            buddy: Some(left_id),
            parent: Some(parent_id),
        });
        self.arena.get_mut(left_id).buddy = Some(right_id);

        let right_addr = self.arena.get(right_id).addr;
        self.bins[i - 1].push_back(left_id);
        self.bins[i - 1].push_back(right_id);
        self.deallocated.insert(addr, left_id);
        self.deallocated.insert(right_addr, right_id);
        Ok(())
    }

    /// Re-submit a reconstituted parent: either coalesce it with its own
    /// buddy (recursively) or park it in the deallocated pool.
    fn join(&mut self, frame_id: FrameId) {
        let (addr, bin, buddy, parent) = {
            let f = self.arena.get(frame_id);
            debug_assert_eq!(f.status, FrameStatus::Parent);
            (f.addr, f.bin, f.buddy, f.parent)
        };

        let buddy_free = buddy
            .map(|b| self.arena.get(b).status == FrameStatus::Deallocated)
            .unwrap_or(false);

        if buddy_free {
            let buddy_id = buddy.expect("buddy vanished");
            let grandparent = parent.expect("coalescing buddies without a parent");
            self.parents
                .remove(&parent_key(addr, bin))
                .expect("parent index out of sync");
            let buddy_addr = self.arena.get(buddy_id).addr;
            self.deallocated
                .remove(&buddy_addr)
                .expect("buddy missing from deallocated index");
            let buddy_bin = self.arena.get(buddy_id).bin;
            self.unlink_from_bin(buddy_bin, buddy_id);
            self.arena.remove(frame_id);
            self.arena.remove(buddy_id);
            self.join(grandparent);
        } else {
            self.parents
                .remove(&parent_key(addr, bin))
                .expect("parent index out of sync");
            self.arena.get_mut(frame_id).status = FrameStatus::Deallocated;
            self.deallocated.insert(addr, frame_id);
            self.bins[bin].push_back(frame_id);
        }
    }
}

impl FrameManager {
    /// Build the manager and greedily seed the bins from the user-memory
    /// region, largest runs first.
    pub fn new(machine_end: u32) -> FrameManager {
        let mut state = FmState {
            arena: FrameArena::default(),
            allocated: BTreeMap::new(),
            deallocated: BTreeMap::new(),
            parents: BTreeMap::new(),
            bins: (0..NUM_BINS).map(|_| VecDeque::new()).collect(),
        };

        let total_pages = if machine_end > USER_MEM_START {
            (machine_end - USER_MEM_START) >> PAGE_SHIFT
        } else {
            0
        };

        let mut pages_remaining = total_pages;
        let mut addr = USER_MEM_START;
        for bin in (0..NUM_BINS).rev() {
            let run = 1u32 << bin;
            while pages_remaining >= run {
                let id = state.arena.insert(Frame {
                    addr,
                    num_pages: run,
                    status: FrameStatus::Deallocated,
                    bin,
                    buddy: None,
                    parent: None,
                });
                state.bins[bin].push_back(id);
                state.deallocated.insert(addr, id);
                pages_remaining -= run;
                addr += run * PAGE_SIZE as u32;
            }
        }

        FrameManager {
            state: KMutex::new(state),
        }
    }

    /// Allocate a frame of at least `num_pages` pages (rounded up to the
    /// next power of two). Returns the frame's base physical address.
    pub fn alloc(&self, num_pages: u32) -> KernResult<u32> {
        if num_pages == 0 || num_pages > 1 << (NUM_BINS - 1) {
            return Err(KernError::NoMemory);
        }
        let mut state = self.state.lock();

        let mut bin = NUM_BINS - 1;
        while bin > 0 && num_pages <= 1 << (bin - 1) {
            bin -= 1;
        }

        if state.bins[bin].is_empty() {
            state.split(bin + 1)?;
        }

        let id = state.bins[bin].pop_front().expect("split left bin empty");
        let addr = {
            let frame = state.arena.get_mut(id);
            debug_assert_eq!(frame.status, FrameStatus::Deallocated);
            frame.status = FrameStatus::Allocated;
            frame.addr
        };
        state.deallocated.remove(&addr);
        state.allocated.insert(addr, id);
        Ok(addr)
    }

    /// Return the frame based at `addr`, coalescing with its buddy when
    /// possible.
    pub fn dealloc(&self, addr: u32) -> KernResult<()> {
        let mut state = self.state.lock();

        let id = state.allocated.remove(&addr).ok_or(KernError::NotFound)?;
        let (buddy, parent) = {
            let frame = state.arena.get(id);
            debug_assert_eq!(frame.status, FrameStatus::Allocated);
            (frame.buddy, frame.parent)
        };

        let buddy_free = buddy
            .map(|b| state.arena.get(b).status == FrameStatus::Deallocated)
            .unwrap_or(false);

        if buddy_free {
            let buddy_id = buddy.expect("buddy vanished");
            let parent_id = parent.expect("coalescing buddies without a parent");
            let (buddy_addr, buddy_bin) = {
                let b = state.arena.get(buddy_id);
                (b.addr, b.bin)
            };
            state
                .deallocated
                .remove(&buddy_addr)
                .expect("buddy missing from deallocated index");
            state.unlink_from_bin(buddy_bin, buddy_id);
            state.arena.remove(id);
            state.arena.remove(buddy_id);
            state.join(parent_id);
        } else {
            let bin = {
                let frame = state.arena.get_mut(id);
                frame.status = FrameStatus::Deallocated;
                frame.bin
            };
            state.deallocated.insert(addr, id);
            state.bins[bin].push_back(id);
        }
        Ok(())
    }

    /// Pages currently sitting in free bins.
    pub fn free_pages(&self) -> u32 {
        let state = self.state.lock();
        state
            .deallocated
            .values()
            .map(|&id| state.arena.get(id).num_pages)
            .sum()
    }

    /// Pages handed out and not yet returned.
    pub fn allocated_pages(&self) -> u32 {
        let state = self.state.lock();
        state
            .allocated
            .values()
            .map(|&id| state.arena.get(id).num_pages)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u32 = 0x10_0000;

    fn manager(pool_pages: u32) -> FrameManager {
        FrameManager::new(USER_MEM_START + pool_pages * PAGE_SIZE as u32)
    }

    fn pool_conserved(fm: &FrameManager, pool_pages: u32) {
        assert_eq!(fm.free_pages() + fm.allocated_pages(), pool_pages);
    }

    #[test]
    fn seeds_largest_bins_first() {
        let fm = manager(1024 + 256 + 1);
        // one 1024-run, one 256-run, one single page
        assert_eq!(fm.free_pages(), 1281);
        assert_eq!(fm.allocated_pages(), 0);
    }

    #[test]
    fn alloc_rounds_up_to_power_of_two() {
        let fm = manager(1024);
        let base = fm.alloc(3).unwrap();
        assert_eq!(base % (4 * PAGE_SIZE as u32), 0);
        assert_eq!(fm.allocated_pages(), 4);
        pool_conserved(&fm, 1024);
    }

    #[test]
    fn split_and_coalesce_round_trip() {
        let fm = manager(1024);
        let a = fm.alloc(1).unwrap();
        // splitting down from the 1024-run created a full ladder of buddies
        assert_eq!(fm.allocated_pages(), 1);
        pool_conserved(&fm, 1024);
        fm.dealloc(a).unwrap();
        // everything coalesced back into the single seed frame
        assert_eq!(fm.free_pages(), 1024);
        assert_eq!(fm.allocated_pages(), 0);
        let b = fm.alloc(1024).unwrap();
        assert_eq!(b, USER_MEM_START);
        fm.dealloc(b).unwrap();
    }

    #[test]
    fn buddies_reunite_only_when_both_free() {
        let fm = manager(2);
        let a = fm.alloc(1).unwrap();
        let b = fm.alloc(1).unwrap();
        assert_ne!(a, b);
        fm.dealloc(a).unwrap();
        // sibling still allocated: the pair must not have coalesced
        assert_eq!(fm.free_pages(), 1);
        // the two-page run is not available yet
        assert!(fm.alloc(2).is_err());
        fm.dealloc(b).unwrap();
        assert_eq!(fm.alloc(2).unwrap(), USER_MEM_START);
    }

    #[test]
    fn distinct_allocations_never_overlap() {
        let fm = manager(64);
        let mut bases = alloc::vec::Vec::new();
        for _ in 0..16 {
            bases.push(fm.alloc(4).unwrap());
        }
        bases.sort_unstable();
        for pair in bases.windows(2) {
            assert!(pair[0] + 4 * PAGE_SIZE as u32 <= pair[1]);
        }
        assert!(fm.alloc(1).is_err());
        for base in bases {
            fm.dealloc(base).unwrap();
        }
        pool_conserved(&fm, 64);
    }

    #[test]
    fn rejects_zero_oversized_and_unknown() {
        let fm = manager(1024);
        assert_eq!(fm.alloc(0), Err(KernError::NoMemory));
        assert_eq!(fm.alloc(2048), Err(KernError::NoMemory));
        assert_eq!(fm.dealloc(USER_MEM_START + MIB), Err(KernError::NotFound));
    }

    #[test]
    fn churn_conserves_the_pool() {
        let fm = manager(256);
        let mut held = alloc::vec::Vec::new();
        for round in 0..50u32 {
            let pages = 1 << (round % 5);
            if let Ok(base) = fm.alloc(pages) {
                held.push(base);
            }
            if round % 3 == 0 {
                if let Some(base) = held.pop() {
                    fm.dealloc(base).unwrap();
                }
            }
            pool_conserved(&fm, 256);
        }
        for base in held {
            fm.dealloc(base).unwrap();
        }
        assert_eq!(fm.free_pages(), 256);
    }
}
