//! Virtual memory manager.
//!
//! Composes the frame manager and a page directory: finds physical frames
//! for new mappings, hands frames back when mappings die, and keeps the
//! directory's owned-frame ledger in step. Every multi-page operation runs
//! as an all-or-nothing mapping batch.

use crate::errors::{KernError, KernResult};
use crate::memory::frame_manager::FrameManager;
use crate::memory::mem_section::{bounding_addrs, section_covering, MemSection};
use crate::memory::page_directory::{entry_addr, entry_flags, EntryFlags, PageDirectory};
use crate::memory::{is_page_aligned, page_align_down, page_align_up, PAGE_SIZE, USER_MEM_START};

/// Table flags for pages inside the bounding range that no section claims.
fn default_pte_flags() -> EntryFlags {
    EntryFlags::PRESENT | EntryFlags::USER
}

fn default_pde_flags() -> EntryFlags {
    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
}

fn user_rw() -> EntryFlags {
    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
}

/// Map every section into `pd`, backed by one contiguous physical frame
/// covering the page-aligned bounding range. The freshly mapped region is
/// zeroed; section contents are copied afterwards by the loader.
pub fn map_sections(
    fm: &FrameManager,
    pd: &mut PageDirectory,
    sections: &[MemSection],
) -> KernResult<()> {
    let (low, high) = bounding_addrs(sections).ok_or(KernError::BadPointer)?;
    let v_addr_low = page_align_down(low);
    let v_addr_high = page_align_up(high);
    let num_pages = (v_addr_high - v_addr_low) / PAGE_SIZE as u32;
    if num_pages == 0 {
        return Ok(());
    }

    let p_addr_start = fm.alloc(num_pages)?;
    pd.alloc_frame(p_addr_start, num_pages);

    if let Err(e) = pd.begin_mapping() {
        pd.dealloc_frame(p_addr_start).ok();
        fm.dealloc(p_addr_start).ok();
        return Err(e);
    }

    let mut v_addr = v_addr_low;
    let mut p_addr = p_addr_start;
    for _ in 0..num_pages {
        let (pde_f, pte_f) = match section_covering(sections, v_addr, v_addr + PAGE_SIZE as u32 - 1)
        {
            Some(section) => (section.pde_flags, section.pte_flags),
            None => (default_pde_flags(), default_pte_flags()),
        };
        if let Err(e) = pd.create_mapping(v_addr, p_addr, pde_f, pte_f) {
            pd.abort_mapping();
            pd.dealloc_frame(p_addr_start).ok();
            fm.dealloc(p_addr_start).ok();
            return Err(e);
        }
        v_addr += PAGE_SIZE as u32;
        p_addr += PAGE_SIZE as u32;
    }
    pd.commit_mapping();

    unsafe {
        crate::arch::zero_bytes(v_addr_low, (num_pages as usize) * PAGE_SIZE);
    }
    Ok(())
}

/// Back `[base, base + num_pages * PAGE_SIZE)` with a fresh frame, mapped
/// user read-write and zeroed. The first and last entries carry the
/// user-range bound flags so `remove_user_page` can find the region again.
pub fn new_user_page(
    fm: &FrameManager,
    pd: &mut PageDirectory,
    base: u32,
    num_pages: u32,
) -> KernResult<()> {
    if num_pages == 0 || num_pages > 0xFFFF {
        return Err(KernError::BadPointer);
    }
    if !is_page_aligned(base) || base < USER_MEM_START {
        return Err(KernError::BadPointer);
    }
    let span = (num_pages as u64) * PAGE_SIZE as u64;
    if base as u64 + span > u32::MAX as u64 + 1 {
        return Err(KernError::Overflow);
    }

    let mut v_addr = base;
    for _ in 0..num_pages {
        if pd.get_mapping(v_addr).is_ok() {
            return Err(KernError::Overlap);
        }
        v_addr += PAGE_SIZE as u32;
    }

    let p_addr_start = fm.alloc(num_pages)?;
    pd.alloc_frame(p_addr_start, num_pages);

    if let Err(e) = pd.begin_mapping() {
        pd.dealloc_frame(p_addr_start).ok();
        fm.dealloc(p_addr_start).ok();
        return Err(e);
    }

    let mut v_addr = base;
    let mut p_addr = p_addr_start;
    for i in 0..num_pages {
        let mut pte_f = user_rw();
        if i == 0 {
            pte_f |= EntryFlags::USER_RANGE_START;
        }
        if i == num_pages - 1 {
            pte_f |= EntryFlags::USER_RANGE_END;
        }
        if let Err(e) = pd.create_mapping(v_addr, p_addr, user_rw(), pte_f) {
            pd.abort_mapping();
            pd.dealloc_frame(p_addr_start).ok();
            fm.dealloc(p_addr_start).ok();
            return Err(e);
        }
        v_addr += PAGE_SIZE as u32;
        p_addr += PAGE_SIZE as u32;
    }
    pd.commit_mapping();

    unsafe {
        crate::arch::zero_bytes(base, (num_pages as usize) * PAGE_SIZE);
    }
    Ok(())
}

/// Undo a `new_user_page` region starting at `base`. The entry at `base`
/// must carry the user-range-start flag; unmapping walks forward until the
/// entry flagged user-range-end, then the owning frame goes back to the
/// frame manager.
pub fn remove_user_page(fm: &FrameManager, pd: &mut PageDirectory, base: u32) -> KernResult<()> {
    if base < USER_MEM_START || !is_page_aligned(base) {
        return Err(KernError::BadPointer);
    }
    let first = pd.get_mapping(base)?;
    if !entry_flags(first).contains(EntryFlags::USER_RANGE_START) {
        return Err(KernError::NotOwner);
    }
    let p_addr_base = entry_addr(first);

    pd.begin_mapping()?;
    let mut v_addr = base;
    loop {
        let entry = match pd.get_mapping(v_addr) {
            Ok(e) => e,
            Err(e) => {
                pd.abort_mapping();
                return Err(e);
            }
        };
        if let Err(e) = pd.remove_mapping(v_addr) {
            pd.abort_mapping();
            return Err(e);
        }
        crate::arch::flush_tlb(v_addr);
        if entry_flags(entry).contains(EntryFlags::USER_RANGE_END) {
            break;
        }
        v_addr = match v_addr.checked_add(PAGE_SIZE as u32) {
            Some(next) => next,
            None => {
                pd.abort_mapping();
                return Err(KernError::Overflow);
            }
        };
    }

    let frame_size = match pd.dealloc_frame(p_addr_base) {
        Ok(size) => size,
        Err(e) => {
            pd.abort_mapping();
            return Err(e);
        }
    };
    if let Err(e) = fm.dealloc(p_addr_base) {
        pd.alloc_frame(p_addr_base, frame_size);
        pd.abort_mapping();
        return Err(e);
    }
    pd.commit_mapping();
    Ok(())
}

/// Duplicate the current address space (`src`) into `dst`: one contiguous
/// frame run sized to the source's mapped pages, then a page-by-page copy.
pub fn deep_copy(
    fm: &FrameManager,
    dst: &mut PageDirectory,
    src: &mut PageDirectory,
) -> KernResult<()> {
    let num_pages = src.num_pages();
    if num_pages == 0 {
        return Ok(());
    }
    let p_addr_start = fm.alloc(num_pages)?;
    dst.alloc_frame(p_addr_start, num_pages);

    if let Err(e) = PageDirectory::deep_copy(dst, src, p_addr_start) {
        dst.dealloc_frame(p_addr_start).ok();
        fm.dealloc(p_addr_start).ok();
        return Err(e);
    }
    Ok(())
}

/// Tear down a user address space: return every owned frame, then drop all
/// user mappings and flush the TLB. A frame the manager refuses to take
/// back is logged and leaked; limping along beats tearing down the kernel.
pub fn clear_user_space(fm: &FrameManager, pd: &mut PageDirectory) {
    for range in pd.dealloc_all_frames() {
        if fm.dealloc(range.base).is_err() {
            crate::log_error!(
                "leaking frame {:#x} ({} pages): frame manager refused it",
                range.base,
                range.num_pages
            );
        }
    }
    pd.clear_user_space();
    crate::arch::flush_all_tlb();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page_directory::init_kernel_template;

    const BASE: u32 = 0x0400_0000;

    fn setup(pool_pages: u32) -> (FrameManager, PageDirectory) {
        init_kernel_template();
        let fm = FrameManager::new(USER_MEM_START + pool_pages * PAGE_SIZE as u32);
        let pd = PageDirectory::new().unwrap();
        (fm, pd)
    }

    #[test]
    fn new_user_page_maps_and_flags_bounds() {
        let (fm, mut pd) = setup(64);
        new_user_page(&fm, &mut pd, BASE, 3).unwrap();

        let first = entry_flags(pd.get_mapping(BASE).unwrap());
        let mid = entry_flags(pd.get_mapping(BASE + PAGE_SIZE as u32).unwrap());
        let last = entry_flags(pd.get_mapping(BASE + 2 * PAGE_SIZE as u32).unwrap());
        assert!(first.contains(EntryFlags::USER_RANGE_START));
        assert!(!first.contains(EntryFlags::USER_RANGE_END));
        assert!(!mid.contains(EntryFlags::USER_RANGE_START | EntryFlags::USER_RANGE_END));
        assert!(last.contains(EntryFlags::USER_RANGE_END));
        assert_eq!(pd.num_pages(), 3);
    }

    #[test]
    fn new_user_page_rejects_overlap_and_bad_base() {
        let (fm, mut pd) = setup(64);
        new_user_page(&fm, &mut pd, BASE, 1).unwrap();
        assert_eq!(new_user_page(&fm, &mut pd, BASE, 1), Err(KernError::Overlap));
        assert_eq!(
            new_user_page(&fm, &mut pd, BASE + 1, 1),
            Err(KernError::BadPointer)
        );
        assert_eq!(
            new_user_page(&fm, &mut pd, 0x1000, 1),
            Err(KernError::BadPointer)
        );
        assert_eq!(
            new_user_page(&fm, &mut pd, 0xFFFF_F000, 2),
            Err(KernError::Overflow)
        );
    }

    #[test]
    fn remove_user_page_round_trips() {
        let (fm, mut pd) = setup(64);
        let free_before = fm.free_pages();
        new_user_page(&fm, &mut pd, BASE, 2).unwrap();
        // not the start of a region
        assert_eq!(
            remove_user_page(&fm, &mut pd, BASE + PAGE_SIZE as u32),
            Err(KernError::NotOwner)
        );
        remove_user_page(&fm, &mut pd, BASE).unwrap();
        assert_eq!(pd.get_mapping(BASE), Err(KernError::NotFound));
        assert_eq!(pd.num_pages(), 0);
        assert_eq!(fm.free_pages(), free_before);
        // removing again fails cleanly
        assert_eq!(remove_user_page(&fm, &mut pd, BASE), Err(KernError::NotFound));
    }

    #[test]
    fn map_sections_uses_section_flags_and_default_gap() {
        let (fm, mut pd) = setup(64);
        let text = MemSection::new(
            BASE,
            0x800,
            default_pde_flags(),
            EntryFlags::PRESENT | EntryFlags::USER,
        );
        let data = MemSection::new(BASE + 2 * PAGE_SIZE as u32, 0x100, default_pde_flags(), user_rw());
        map_sections(&fm, &mut pd, &[text, data]).unwrap();

        // page 0: text, read-only
        assert!(!entry_flags(pd.get_mapping(BASE).unwrap()).contains(EntryFlags::WRITABLE));
        // page 1: gap page inside the bounding range, default user read-only
        assert!(pd.get_mapping(BASE + PAGE_SIZE as u32).is_ok());
        // page 2: data, writable
        assert!(entry_flags(pd.get_mapping(BASE + 2 * PAGE_SIZE as u32).unwrap())
            .contains(EntryFlags::WRITABLE));
        assert_eq!(pd.num_pages(), 3);
    }

    #[test]
    fn map_sections_failure_returns_the_frame() {
        let (fm, mut pd) = setup(8);
        let huge = MemSection::new(BASE, 64 * PAGE_SIZE as u32, default_pde_flags(), user_rw());
        let free_before = fm.free_pages();
        assert!(map_sections(&fm, &mut pd, &[huge]).is_err());
        assert_eq!(fm.free_pages(), free_before);
        assert_eq!(pd.num_frames(), 0);
    }

    #[test]
    fn clear_user_space_returns_every_frame() {
        let (fm, mut pd) = setup(64);
        new_user_page(&fm, &mut pd, BASE, 2).unwrap();
        new_user_page(&fm, &mut pd, BASE + 0x10_0000, 1).unwrap();
        let free_before_any = 64;
        clear_user_space(&fm, &mut pd);
        assert_eq!(fm.free_pages(), free_before_any);
        assert_eq!(pd.num_frames(), 0);
        assert_eq!(pd.get_mapping(BASE), Err(KernError::NotFound));
    }

    #[test]
    fn deep_copy_allocates_matching_run() {
        let (fm, mut src) = setup(64);
        let mut dst = PageDirectory::new().unwrap();
        new_user_page(&fm, &mut src, BASE, 2).unwrap();
        deep_copy(&fm, &mut dst, &mut src).unwrap();
        assert_eq!(dst.num_pages(), src.num_pages());
        let src_entry = src.get_mapping(BASE).unwrap();
        let dst_entry = dst.get_mapping(BASE).unwrap();
        assert_ne!(entry_addr(src_entry), entry_addr(dst_entry));
        assert_eq!(entry_flags(src_entry), entry_flags(dst_entry));
    }
}
