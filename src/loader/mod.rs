//! Program images and the ELF32 loader.
//!
//! Executables live in a static read-only table compiled into the kernel
//! image; `getbytes` is the only way anything reads them (`exec` and the
//! `readfile` syscall both go through it). Loading stages a parsed image
//! first and only then touches the destination address space, so a bad
//! image never costs a process its mappings.

use crate::arch;
use crate::errors::{KernError, KernResult};
use crate::memory::frame_manager::FrameManager;
use crate::memory::mem_section::MemSection;
use crate::memory::page_directory::{EntryFlags, PageDirectory};
use crate::memory::vmm;
use crate::memory::{PAGE_SIZE, USER_MEM_START};
use crate::scheduler::context::TrapFrame;
use crate::scheduler::pcb::Pcb;
use alloc::vec::Vec;

pub struct ProgramImage {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// Read-only table of executables built into the kernel image. A bare
/// kernel build ships none; the integration build links user programs in
/// here.
pub static PROGRAMS: &[ProgramImage] = &[];

/// One page of user stack, just below the top of user space.
const USER_STACK_TOP: u32 = 0xFFC0_0000;
const MAX_ARG_BYTES: usize = 2048;

pub fn find(name: &str) -> Option<&'static ProgramImage> {
    PROGRAMS.iter().find(|p| p.name == name)
}

/// Bounded copy-out of `count` bytes at `offset` from the named image.
/// Returns the number of bytes copied.
pub fn getbytes(name: &str, offset: usize, count: usize, buf: &mut [u8]) -> KernResult<usize> {
    let image = find(name).ok_or(KernError::NotFound)?;
    if offset >= image.bytes.len() {
        return Ok(0);
    }
    let n = count.min(buf.len()).min(image.bytes.len() - offset);
    buf[..n].copy_from_slice(&image.bytes[offset..offset + n]);
    Ok(n)
}

// ELF32 constants
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

struct Elf32Ehdr {
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf32Ehdr {
    fn parse(data: &[u8]) -> KernResult<Elf32Ehdr> {
        if data.len() < 52 || data[0..4] != ELF_MAGIC {
            return Err(KernError::BadPointer);
        }
        if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB {
            return Err(KernError::BadPointer);
        }
        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC || e_machine != EM_386 {
            return Err(KernError::BadPointer);
        }
        Ok(Elf32Ehdr {
            e_entry: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            e_phoff: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[42], data[43]]),
            e_phnum: u16::from_le_bytes([data[44], data[45]]),
        })
    }
}

struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

impl Elf32Phdr {
    fn parse(data: &[u8]) -> KernResult<Elf32Phdr> {
        if data.len() < 32 {
            return Err(KernError::BadPointer);
        }
        Ok(Elf32Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_offset: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_vaddr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            p_filesz: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            p_memsz: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        })
    }
}

/// A parsed, validated image: everything needed to build the address space
/// without touching it yet.
struct StagedProgram {
    entry: u32,
    sections: Vec<MemSection>,
}

fn user_pde_flags() -> EntryFlags {
    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
}

fn stage(name: &str) -> KernResult<StagedProgram> {
    let image = find(name).ok_or(KernError::NotFound)?;
    let bytes = image.bytes;
    let ehdr = Elf32Ehdr::parse(bytes)?;

    let mut sections = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        let end = off + ehdr.e_phentsize as usize;
        if end > bytes.len() {
            return Err(KernError::BadPointer);
        }
        let phdr = Elf32Phdr::parse(&bytes[off..end])?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_vaddr < USER_MEM_START
            || phdr.p_filesz > phdr.p_memsz
            || phdr.p_offset as usize + phdr.p_filesz as usize > bytes.len()
        {
            return Err(KernError::BadPointer);
        }
        let pte_flags = if phdr.p_flags & PF_W != 0 {
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER
        } else {
            EntryFlags::PRESENT | EntryFlags::USER
        };
        let src_start = phdr.p_offset as usize;
        let src_end = src_start + phdr.p_filesz as usize;
        sections.push(
            MemSection::new(phdr.p_vaddr, phdr.p_memsz, user_pde_flags(), pte_flags)
                .with_source(&bytes[src_start..src_end]),
        );
    }
    if sections.is_empty() {
        return Err(KernError::BadPointer);
    }
    Ok(StagedProgram {
        entry: ehdr.e_entry,
        sections,
    })
}

/// Map a staged image plus a user stack into `pd`, copy the section
/// payloads in, and lay the argument block out on the stack. `pd` must be
/// the active directory. Returns the entry frame.
fn install(
    fm: &FrameManager,
    pd: &mut PageDirectory,
    staged: &StagedProgram,
    args: &[Vec<u8>],
) -> KernResult<TrapFrame> {
    vmm::map_sections(fm, pd, &staged.sections)?;
    for section in &staged.sections {
        if let Some(src) = section.src {
            unsafe {
                arch::write_bytes(section.start, src);
            }
        }
    }

    let stack = [MemSection::new(
        USER_STACK_TOP - PAGE_SIZE as u32,
        PAGE_SIZE as u32,
        user_pde_flags(),
        user_pde_flags(),
    )];
    vmm::map_sections(fm, pd, &stack)?;

    let esp = build_argument_block(args)?;
    Ok(TrapFrame::user(staged.entry, esp))
}

/// Lay out the argument block at the top of the (already mapped, already
/// zeroed) user stack: string bytes first, then the pointer vector, then
/// `main`'s actual arguments. Returns the initial user stack pointer.
fn build_argument_block(args: &[Vec<u8>]) -> KernResult<u32> {
    let total: usize = args.iter().map(|a| a.len() + 1).sum();
    if total > MAX_ARG_BYTES {
        return Err(KernError::Overflow);
    }

    let mut sp = USER_STACK_TOP;
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for arg in args {
        sp -= arg.len() as u32 + 1;
        unsafe {
            arch::write_bytes(sp, arg);
            arch::write_bytes(sp + arg.len() as u32, &[0]);
        }
        arg_ptrs.push(sp);
    }
    sp &= !3;

    // argv vector, NULL-terminated
    sp -= 4;
    unsafe { arch::write_u32(sp, 0) };
    for &ptr in arg_ptrs.iter().rev() {
        sp -= 4;
        unsafe { arch::write_u32(sp, ptr) };
    }
    let argv_base = sp;

    // main(argc, argv), with a null return address underneath
    sp -= 4;
    unsafe { arch::write_u32(sp, argv_base) };
    sp -= 4;
    unsafe { arch::write_u32(sp, args.len() as u32) };
    sp -= 4;
    unsafe { arch::write_u32(sp, 0) };
    Ok(sp)
}

/// Load `name` into a fresh PCB (boot path; `pcb`'s directory must already
/// be the active one).
pub fn load_into(
    fm: &FrameManager,
    pcb: &Pcb,
    name: &str,
    args: &[Vec<u8>],
) -> KernResult<TrapFrame> {
    let staged = stage(name)?;
    let mut pd = pcb.pd();
    install(fm, &mut pd, &staged, args)
}

/// Replace the current process's address space with `name`. The image is
/// staged before the old space is torn down, so a missing or malformed
/// image leaves the caller untouched. A failure after teardown (frame
/// exhaustion) is fatal to the process.
pub fn exec_current(
    fm: &FrameManager,
    pcb: &Pcb,
    name: &str,
    args: &[Vec<u8>],
) -> KernResult<TrapFrame> {
    let staged = stage(name)?;
    let mut pd = pcb.pd();
    vmm::clear_user_space(fm, &mut pd);
    install(fm, &mut pd, &staged, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getbytes_unknown_image_fails() {
        let mut buf = [0u8; 8];
        assert_eq!(
            getbytes("no-such-program", 0, 8, &mut buf),
            Err(KernError::NotFound)
        );
    }

    #[test]
    fn ehdr_rejects_foreign_binaries() {
        // 64-bit class byte
        let mut bytes = [0u8; 52];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = 2;
        bytes[5] = ELFDATA2LSB;
        assert!(Elf32Ehdr::parse(&bytes).is_err());
        // right class, wrong machine
        bytes[4] = ELFCLASS32;
        bytes[16] = 2; // ET_EXEC
        bytes[18] = 62; // EM_X86_64
        assert!(Elf32Ehdr::parse(&bytes).is_err());
    }

    #[test]
    fn ehdr_accepts_a_minimal_i386_executable() {
        let mut bytes = [0u8; 52];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = ELFCLASS32;
        bytes[5] = ELFDATA2LSB;
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&EM_386.to_le_bytes());
        bytes[24..28].copy_from_slice(&0x0100_0000u32.to_le_bytes());
        let ehdr = Elf32Ehdr::parse(&bytes).unwrap();
        assert_eq!(ehdr.e_entry, 0x0100_0000);
    }
}
