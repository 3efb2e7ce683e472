//! Per-process two-level page tables.
//!
//! A virtual address splits into a 10-bit directory index, a 10-bit table
//! index, and a 12-bit offset. Each `PageDirectory` exclusively owns its
//! top-level table and every user-space second-level table it allocates;
//! kernel-space entries are copied from a process-wide template built once
//! at boot, whose tables are shared by every address space and never freed.
//!
//! Mappings can be batched: between `begin_mapping` and `commit_mapping`,
//! entry writes are journaled instead of applied, so a multi-page operation
//! either lands completely or aborts without a trace. Second-level tables
//! needed by journaled writes are allocated up front and torn back out on
//! abort, which is what lets commit never fail.

use crate::errors::{KernError, KernResult};
use crate::memory::{is_page_aligned, PAGE_SHIFT, PAGE_SIZE, USER_MEM_START};
use alloc::alloc::{alloc_zeroed, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bit_field::BitField;
use bitflags::bitflags;
use spin::Once;

pub const PD_NUM_ENTRIES: usize = 1024;
pub const PT_NUM_ENTRIES: usize = 1024;

/// Page table entries covering the kernel direct map.
pub const NUM_KERNEL_PTE: usize = (USER_MEM_START >> PAGE_SHIFT) as usize;
/// Directory entries covering the kernel direct map.
pub const NUM_KERNEL_PDE: usize = NUM_KERNEL_PTE / PT_NUM_ENTRIES;

bitflags! {
    /// Flag bits shared by directory and table entries. Bits 9 and 10 are
    /// ignored by the MMU; they bound regions handed out by `new_pages`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const GLOBAL = 1 << 8;
        const USER_RANGE_START = 1 << 9;
        const USER_RANGE_END = 1 << 10;
    }
}

const FLAGS_MASK: u32 = 0xFFF;
const ADDR_MASK: u32 = !FLAGS_MASK;

pub fn entry_present(entry: u32) -> bool {
    entry & EntryFlags::PRESENT.bits() != 0
}

pub fn entry_addr(entry: u32) -> u32 {
    entry & ADDR_MASK
}

pub fn entry_flags(entry: u32) -> EntryFlags {
    EntryFlags::from_bits_truncate(entry & FLAGS_MASK)
}

fn pde_index(v_addr: u32) -> usize {
    v_addr.get_bits(22..32) as usize
}

fn pte_index(v_addr: u32) -> usize {
    v_addr.get_bits(12..22) as usize
}

fn page_address(pde_i: usize, pte_i: usize) -> u32 {
    ((pde_i as u32) << 22) | ((pte_i as u32) << PAGE_SHIFT)
}

/// One 4 KiB table of 1024 entries, used for both levels. The alignment
/// makes the heap address usable directly as the physical base the hardware
/// sees (kernel memory is identity-mapped).
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u32; PT_NUM_ENTRIES],
}

impl PageTable {
    /// Allocate a zeroed table straight on the heap; a stack temporary
    /// would not fit on a one-page kernel stack.
    fn new_boxed() -> KernResult<Box<PageTable>> {
        let layout = Layout::new::<PageTable>();
        let ptr = unsafe { alloc_zeroed(layout) } as *mut PageTable;
        if ptr.is_null() {
            return Err(KernError::NoMemory);
        }
        Ok(unsafe { Box::from_raw(ptr) })
    }

    fn phys_base(&self) -> u32 {
        self as *const PageTable as usize as u32
    }
}

/// Kernel-space directory entries, identical in every address space.
static KERNEL_PDES: Once<[u32; NUM_KERNEL_PDE]> = Once::new();

/// Build the process-wide kernel mapping template: identity-map every page
/// in `[PAGE_SIZE, USER_MEM_START)` supervisor/read-write/present with the
/// global bit set, leaving page 0 unmapped so null dereferences trap.
pub fn init_kernel_template() {
    KERNEL_PDES.call_once(|| {
        let pte_flags =
            (EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL).bits();
        let pde_flags = (EntryFlags::PRESENT | EntryFlags::WRITABLE).bits();

        let mut pdes = [0u32; NUM_KERNEL_PDE];
        for (pde_i, pde) in pdes.iter_mut().enumerate() {
            let table = PageTable::new_boxed().expect("no memory for the kernel template");
            let table: &'static mut PageTable = Box::leak(table);
            for (pte_i, entry) in table.entries.iter_mut().enumerate() {
                let page = (pde_i * PT_NUM_ENTRIES + pte_i) as u32;
                if page == 0 {
                    continue;
                }
                *entry = (page << PAGE_SHIFT) | pte_flags;
            }
            *pde = table.phys_base() | pde_flags;
        }
        pdes
    });
}

/// Effective access rights of one mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub user: bool,
    pub writable: bool,
}

/// A journaled write, applied on commit. `fresh_table` names a directory
/// slot whose second-level table was allocated for this op and must be torn
/// out again on abort.
struct MappingOp {
    v_addr: u32,
    entry: u32,
    fresh_table: Option<usize>,
}

/// A physical frame run owned by a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRange {
    pub base: u32,
    pub num_pages: u32,
}

pub struct PageDirectory {
    dir: Box<PageTable>,
    /// User-space second-level tables, keyed by directory index.
    tables: BTreeMap<usize, Box<PageTable>>,
    owned_frames: Vec<FrameRange>,
    num_pages: u32,
    journal: Vec<MappingOp>,
    batch_enabled: bool,
}

impl PageDirectory {
    pub fn new() -> KernResult<PageDirectory> {
        let kernel_pdes = KERNEL_PDES
            .get()
            .expect("kernel template missing; call init_kernel_template first");
        let mut dir = PageTable::new_boxed()?;
        dir.entries[..NUM_KERNEL_PDE].copy_from_slice(kernel_pdes);
        Ok(PageDirectory {
            dir,
            tables: BTreeMap::new(),
            owned_frames: Vec::new(),
            num_pages: 0,
            journal: Vec::new(),
            batch_enabled: false,
        })
    }

    /// Physical address to load into the page-directory base register.
    pub fn base_addr(&self) -> u32 {
        self.dir.phys_base()
    }

    fn raw_entry(&self, v_addr: u32) -> Option<u32> {
        let pde_i = pde_index(v_addr);
        let pte_i = pte_index(v_addr);
        let pde = self.dir.entries[pde_i];
        if !entry_present(pde) {
            return None;
        }
        if pde_i < NUM_KERNEL_PDE {
            // Kernel direct map: the entry follows from the template layout,
            // no need to chase the shared table.
            let page = (pde_i * PT_NUM_ENTRIES + pte_i) as u32;
            if page == 0 {
                return None;
            }
            let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::GLOBAL;
            return Some((page << PAGE_SHIFT) | flags.bits());
        }
        let table = self.tables.get(&pde_i)?;
        let entry = table.entries[pte_i];
        if entry_present(entry) {
            Some(entry)
        } else {
            None
        }
    }

    /// Look up the table entry mapping `v_addr`.
    pub fn get_mapping(&self, v_addr: u32) -> KernResult<u32> {
        self.raw_entry(v_addr).ok_or(KernError::NotFound)
    }

    /// Effective privilege and access of `v_addr`: user only when both
    /// levels agree, and writable (for user pages) only when both levels
    /// allow it. Supervisor pages are always read-write to the kernel.
    pub fn get_permissions(&self, v_addr: u32) -> KernResult<Permissions> {
        let pde_i = pde_index(v_addr);
        let pde = self.dir.entries[pde_i];
        let entry = self.raw_entry(v_addr).ok_or(KernError::NotFound)?;

        let pde_flags = entry_flags(pde);
        let pte_flags = entry_flags(entry);
        let user = pde_flags.contains(EntryFlags::USER) && pte_flags.contains(EntryFlags::USER);
        let writable = if user {
            pde_flags.contains(EntryFlags::WRITABLE) && pte_flags.contains(EntryFlags::WRITABLE)
        } else {
            true
        };
        Ok(Permissions { user, writable })
    }

    pub fn is_user_readable(&self, v_addr: u32) -> bool {
        self.get_permissions(v_addr).map_or(false, |p| p.user)
    }

    pub fn is_user_writable(&self, v_addr: u32) -> bool {
        self.get_permissions(v_addr)
            .map_or(false, |p| p.user && p.writable)
    }

    /// Map `v_addr` to the physical page `p_addr`. Allocates the
    /// second-level table on demand; journals the entry write while a batch
    /// is open.
    pub fn create_mapping(
        &mut self,
        v_addr: u32,
        p_addr: u32,
        pde_flags: EntryFlags,
        pte_flags: EntryFlags,
    ) -> KernResult<()> {
        if !is_page_aligned(v_addr) || !is_page_aligned(p_addr) {
            return Err(KernError::BadPointer);
        }
        let pde_i = pde_index(v_addr);
        if pde_i < NUM_KERNEL_PDE {
            return Err(KernError::BadPointer);
        }
        let pte_i = pte_index(v_addr);
        let entry = p_addr | pte_flags.bits();

        let mut fresh_table = None;
        if !entry_present(self.dir.entries[pde_i]) {
            let table = PageTable::new_boxed()?;
            self.dir.entries[pde_i] = table.phys_base() | pde_flags.bits();
            self.tables.insert(pde_i, table);
            fresh_table = Some(pde_i);
        }

        if self.batch_enabled {
            self.journal.push(MappingOp {
                v_addr,
                entry,
                fresh_table,
            });
        } else {
            let table = self.tables.get_mut(&pde_i).expect("table just installed");
            table.entries[pte_i] = entry;
        }
        Ok(())
    }

    /// Zero the entry mapping `v_addr` (journaled while a batch is open).
    pub fn remove_mapping(&mut self, v_addr: u32) -> KernResult<()> {
        if !is_page_aligned(v_addr) {
            return Err(KernError::BadPointer);
        }
        let pde_i = pde_index(v_addr);
        if pde_i < NUM_KERNEL_PDE {
            return Err(KernError::BadPointer);
        }
        self.raw_entry(v_addr).ok_or(KernError::NotFound)?;

        if self.batch_enabled {
            self.journal.push(MappingOp {
                v_addr,
                entry: 0,
                fresh_table: None,
            });
        } else {
            let table = self.tables.get_mut(&pde_i).expect("entry present without table");
            table.entries[pte_index(v_addr)] = 0;
        }
        Ok(())
    }

    pub fn begin_mapping(&mut self) -> KernResult<()> {
        if self.batch_enabled {
            return Err(KernError::AlreadyInState);
        }
        self.batch_enabled = true;
        Ok(())
    }

    /// Apply every journaled write. All resources were acquired when the
    /// writes were journaled, so this cannot fail.
    pub fn commit_mapping(&mut self) {
        let ops = core::mem::take(&mut self.journal);
        for op in ops {
            let pde_i = pde_index(op.v_addr);
            let table = self
                .tables
                .get_mut(&pde_i)
                .expect("journaled write without its table");
            table.entries[pte_index(op.v_addr)] = op.entry;
        }
        self.batch_enabled = false;
    }

    /// Throw the journal away, freeing tables allocated on its behalf.
    pub fn abort_mapping(&mut self) {
        let ops = core::mem::take(&mut self.journal);
        for op in ops {
            if let Some(pde_i) = op.fresh_table {
                self.tables.remove(&pde_i);
                self.dir.entries[pde_i] = 0;
            }
        }
        self.batch_enabled = false;
    }

    /// Record ownership of a physical frame run.
    pub fn alloc_frame(&mut self, base: u32, num_pages: u32) {
        self.num_pages += num_pages;
        self.owned_frames.insert(0, FrameRange { base, num_pages });
    }

    /// Drop ownership of the run based at `base`; returns its length.
    pub fn dealloc_frame(&mut self, base: u32) -> KernResult<u32> {
        let pos = self
            .owned_frames
            .iter()
            .position(|r| r.base == base)
            .ok_or(KernError::NotFound)?;
        let range = self.owned_frames.remove(pos);
        self.num_pages -= range.num_pages;
        Ok(range.num_pages)
    }

    /// Drop ownership of every frame run, handing them to the caller.
    pub fn dealloc_all_frames(&mut self) -> Vec<FrameRange> {
        self.num_pages = 0;
        core::mem::take(&mut self.owned_frames)
    }

    pub fn num_frames(&self) -> usize {
        self.owned_frames.len()
    }

    /// Pages currently mapped on behalf of user space.
    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// Free every user-space second-level table and zero the corresponding
    /// directory entries. Owned physical frames are untouched; releasing
    /// them is the VMM's job.
    pub fn clear_user_space(&mut self) {
        for pde_i in NUM_KERNEL_PDE..PD_NUM_ENTRIES {
            if entry_present(self.dir.entries[pde_i]) {
                self.dir.entries[pde_i] = 0;
            }
        }
        self.tables.clear();
    }

    /// Copy one mapped page to a new physical page by temporarily remapping
    /// the source virtual address in this (the currently active) directory.
    /// Avoids needing a kernel window over all of physical memory.
    fn copy_page_contents(&mut self, pde_i: usize, pte_i: usize, new_p_addr: u32) {
        let v_addr = page_address(pde_i, pte_i);
        let mut buffer = alloc::vec![0u8; PAGE_SIZE];
        unsafe {
            crate::arch::read_bytes(v_addr, &mut buffer);
        }

        let table = self.tables.get_mut(&pde_i).expect("copying an unmapped table");
        let original = table.entries[pte_i];
        table.entries[pte_i] = new_p_addr | (original & FLAGS_MASK);
        crate::arch::flush_tlb(v_addr);
        unsafe {
            crate::arch::write_bytes(v_addr, &buffer);
        }
        let table = self.tables.get_mut(&pde_i).expect("copying an unmapped table");
        table.entries[pte_i] = original;
        crate::arch::flush_tlb(v_addr);
    }

    /// Deep-copy the user half of `src` into `dst`, consuming physical
    /// pages sequentially from `p_addr_start`. `src` must be the active
    /// directory (the copy goes through its live mappings).
    pub fn deep_copy(
        dst: &mut PageDirectory,
        src: &mut PageDirectory,
        p_addr_start: u32,
    ) -> KernResult<()> {
        let mut p_addr = p_addr_start;
        let mut created: Vec<usize> = Vec::new();

        for pde_i in NUM_KERNEL_PDE..PD_NUM_ENTRIES {
            let pde = src.dir.entries[pde_i];
            if !entry_present(pde) {
                continue;
            }
            let new_table = match PageTable::new_boxed() {
                Ok(t) => t,
                Err(e) => {
                    for i in created {
                        dst.tables.remove(&i);
                        dst.dir.entries[i] = 0;
                    }
                    return Err(e);
                }
            };
            dst.dir.entries[pde_i] = new_table.phys_base() | (pde & FLAGS_MASK);
            dst.tables.insert(pde_i, new_table);
            created.push(pde_i);

            for pte_i in 0..PT_NUM_ENTRIES {
                let entry = src.tables.get(&pde_i).expect("present pde without table").entries
                    [pte_i];
                if !entry_present(entry) {
                    continue;
                }
                src.copy_page_contents(pde_i, pte_i, p_addr);
                let dst_table = dst.tables.get_mut(&pde_i).expect("table just created");
                dst_table.entries[pte_i] = p_addr | (entry & FLAGS_MASK);
                p_addr += PAGE_SIZE as u32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V: u32 = 0x0400_0000;
    const P: u32 = 0x0100_0000;

    fn user_rw() -> EntryFlags {
        EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
    }

    fn user_ro() -> EntryFlags {
        EntryFlags::PRESENT | EntryFlags::USER
    }

    fn fresh() -> PageDirectory {
        init_kernel_template();
        PageDirectory::new().unwrap()
    }

    #[test]
    fn create_then_get_mapping() {
        let mut pd = fresh();
        pd.create_mapping(V, P, user_rw(), user_rw()).unwrap();
        let entry = pd.get_mapping(V).unwrap();
        assert_eq!(entry_addr(entry), P);
        assert!(entry_flags(entry).contains(EntryFlags::USER));
        assert_eq!(pd.get_mapping(V + PAGE_SIZE as u32), Err(KernError::NotFound));
    }

    #[test]
    fn unaligned_addresses_rejected() {
        let mut pd = fresh();
        assert_eq!(
            pd.create_mapping(V + 1, P, user_rw(), user_rw()),
            Err(KernError::BadPointer)
        );
        assert_eq!(
            pd.create_mapping(V, P + 5, user_rw(), user_rw()),
            Err(KernError::BadPointer)
        );
    }

    #[test]
    fn kernel_space_is_mapped_supervisor_and_null_traps() {
        let pd = fresh();
        assert_eq!(pd.get_mapping(0), Err(KernError::NotFound));
        let entry = pd.get_mapping(0x1000).unwrap();
        assert_eq!(entry_addr(entry), 0x1000);
        let perms = pd.get_permissions(0x1000).unwrap();
        assert!(!perms.user);
        assert!(perms.writable);
        assert!(!pd.is_user_readable(0x1000));
    }

    #[test]
    fn permissions_require_user_at_both_levels() {
        let mut pd = fresh();
        // supervisor directory entry, user table entry
        pd.create_mapping(V, P, EntryFlags::PRESENT | EntryFlags::WRITABLE, user_rw())
            .unwrap();
        let perms = pd.get_permissions(V).unwrap();
        assert!(!perms.user);
        assert!(perms.writable);
    }

    #[test]
    fn user_write_access_requires_both_levels() {
        let mut pd = fresh();
        pd.create_mapping(V, P, user_rw(), user_ro()).unwrap();
        let perms = pd.get_permissions(V).unwrap();
        assert!(perms.user);
        assert!(!perms.writable);
        assert!(pd.is_user_readable(V));
        assert!(!pd.is_user_writable(V));
    }

    #[test]
    fn remove_mapping_round_trip() {
        let mut pd = fresh();
        pd.create_mapping(V, P, user_rw(), user_rw()).unwrap();
        pd.remove_mapping(V).unwrap();
        assert_eq!(pd.get_mapping(V), Err(KernError::NotFound));
        assert_eq!(pd.remove_mapping(V), Err(KernError::NotFound));
    }

    #[test]
    fn batch_commit_applies_all_writes() {
        let mut pd = fresh();
        pd.begin_mapping().unwrap();
        for i in 0..4u32 {
            pd.create_mapping(
                V + i * PAGE_SIZE as u32,
                P + i * PAGE_SIZE as u32,
                user_rw(),
                user_rw(),
            )
            .unwrap();
        }
        // journaled, not yet visible
        assert_eq!(pd.get_mapping(V), Err(KernError::NotFound));
        pd.commit_mapping();
        for i in 0..4u32 {
            let entry = pd.get_mapping(V + i * PAGE_SIZE as u32).unwrap();
            assert_eq!(entry_addr(entry), P + i * PAGE_SIZE as u32);
        }
    }

    #[test]
    fn batch_abort_leaves_no_trace() {
        let mut pd = fresh();
        pd.begin_mapping().unwrap();
        pd.create_mapping(V, P, user_rw(), user_rw()).unwrap();
        pd.abort_mapping();
        assert_eq!(pd.get_mapping(V), Err(KernError::NotFound));
        // the fresh second-level table was torn back out
        assert!(pd.tables.is_empty());
        // and a second batch can start cleanly
        pd.begin_mapping().unwrap();
        pd.commit_mapping();
    }

    #[test]
    fn nested_batches_rejected() {
        let mut pd = fresh();
        pd.begin_mapping().unwrap();
        assert_eq!(pd.begin_mapping(), Err(KernError::AlreadyInState));
    }

    #[test]
    fn frame_ownership_accounting() {
        let mut pd = fresh();
        pd.alloc_frame(P, 4);
        pd.alloc_frame(P + 0x1_0000, 2);
        assert_eq!(pd.num_pages(), 6);
        assert_eq!(pd.num_frames(), 2);
        assert_eq!(pd.dealloc_frame(P), Ok(4));
        assert_eq!(pd.dealloc_frame(P), Err(KernError::NotFound));
        let rest = pd.dealloc_all_frames();
        assert_eq!(rest.len(), 1);
        assert_eq!(pd.num_pages(), 0);
    }

    #[test]
    fn clear_user_space_drops_tables_not_kernel() {
        let mut pd = fresh();
        pd.create_mapping(V, P, user_rw(), user_rw()).unwrap();
        pd.clear_user_space();
        assert_eq!(pd.get_mapping(V), Err(KernError::NotFound));
        assert!(pd.get_mapping(0x1000).is_ok());
    }

    #[test]
    fn deep_copy_mirrors_structure_with_new_frames() {
        init_kernel_template();
        let mut src = PageDirectory::new().unwrap();
        let mut dst = PageDirectory::new().unwrap();
        src.create_mapping(V, P, user_rw(), user_ro()).unwrap();
        src.create_mapping(V + PAGE_SIZE as u32, P + PAGE_SIZE as u32, user_rw(), user_rw())
            .unwrap();

        let new_base = P + 0x10_0000;
        PageDirectory::deep_copy(&mut dst, &mut src, new_base).unwrap();

        // source is untouched
        assert_eq!(entry_addr(src.get_mapping(V).unwrap()), P);
        // destination points at the fresh frames with the same flags
        let e0 = dst.get_mapping(V).unwrap();
        let e1 = dst.get_mapping(V + PAGE_SIZE as u32).unwrap();
        assert_eq!(entry_addr(e0), new_base);
        assert_eq!(entry_addr(e1), new_base + PAGE_SIZE as u32);
        assert_eq!(entry_flags(e0), entry_flags(src.get_mapping(V).unwrap()));
        assert!(entry_flags(e1).contains(EntryFlags::WRITABLE));
    }
}
