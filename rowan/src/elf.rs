//! # ELF Loader
//!
//! Loads a statically-linked RISC-V ELF64 executable into the *active*
//! address space. The caller (process exec) has already reset the space;
//! this module validates the image, maps and fills each `PT_LOAD`
//! segment through the range-mapping API, drops the segment permissions
//! to what the program headers ask for, and hands back the entry point.
//!
//! Validation is deliberately fussy — the image comes from user-supplied
//! data, so every field that could send the loader off the rails is
//! checked before it is used.

use crate::conf::{PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};
use crate::error::{Error, Result};
use crate::fs::FsFile;
use crate::memory::{alloc_and_map_range, set_range_flags, PteFlags, VirtAddr};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

/// Maximum program headers we are willing to walk.
const PHNUM_MAX: u16 = 128;

/// Anything the loader can pull bytes out of.
pub trait ElfSource {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;
}

impl ElfSource for FsFile {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        FsFile::read_at(self, pos, buf)
    }
}

struct Ehdr {
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

struct Phdr {
    p_type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn read_exact(source: &impl ElfSource, pos: u64, buf: &mut [u8]) -> Result<()> {
    if source.read_at(pos, buf)? != buf.len() {
        return Err(Error::BadFormat);
    }
    Ok(())
}

fn parse_ehdr(source: &impl ElfSource) -> Result<Ehdr> {
    let mut buf = [0u8; EHDR_SIZE];
    read_exact(source, 0, &mut buf)?;

    if buf[0..4] != ELF_MAGIC {
        return Err(Error::BadFormat);
    }
    if buf[EI_CLASS] != ELFCLASS64 {
        return Err(Error::BadFormat);
    }
    if buf[EI_DATA] != ELFDATA2LSB {
        // RISC-V is little-endian.
        return Err(Error::BadFormat);
    }
    if buf[EI_VERSION] != EV_CURRENT {
        return Err(Error::BadFormat);
    }
    if u16_at(&buf, 16) != ET_EXEC {
        return Err(Error::BadFormat);
    }
    if u16_at(&buf, 18) != EM_RISCV {
        return Err(Error::BadFormat);
    }
    if u32_at(&buf, 20) != EV_CURRENT as u32 {
        return Err(Error::BadFormat);
    }

    let ehdr = Ehdr {
        entry: u64_at(&buf, 24),
        phoff: u64_at(&buf, 32),
        phentsize: u16_at(&buf, 54),
        phnum: u16_at(&buf, 56),
    };

    // The entry point must land inside the user window.
    if (ehdr.entry as usize) < UMEM_START_VMA || (ehdr.entry as usize) >= UMEM_END_VMA {
        return Err(Error::BadFormat);
    }
    if ehdr.phentsize as usize != PHDR_SIZE {
        return Err(Error::BadFormat);
    }
    if ehdr.phnum == 0 || ehdr.phnum > PHNUM_MAX {
        return Err(Error::BadFormat);
    }
    // The header table itself must not wrap.
    let table_size = ehdr.phnum as u64 * PHDR_SIZE as u64;
    if ehdr.phoff.checked_add(table_size).is_none() {
        return Err(Error::BadFormat);
    }

    Ok(ehdr)
}

fn parse_phdr(source: &impl ElfSource, ehdr: &Ehdr, index: u16) -> Result<Phdr> {
    let mut buf = [0u8; PHDR_SIZE];
    read_exact(source, ehdr.phoff + index as u64 * PHDR_SIZE as u64, &mut buf)?;
    Ok(Phdr {
        p_type: u32_at(&buf, 0),
        flags: u32_at(&buf, 4),
        offset: u64_at(&buf, 8),
        vaddr: u64_at(&buf, 16),
        filesz: u64_at(&buf, 32),
        memsz: u64_at(&buf, 40),
    })
}

fn segment_flags(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::U;
    if p_flags & PF_R != 0 {
        flags |= PteFlags::R;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::W;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::X;
    }
    flags
}

/// Load `source` into the active address space and return its entry
/// point.
pub fn load(source: &impl ElfSource) -> Result<VirtAddr> {
    let ehdr = parse_ehdr(source)?;

    for index in 0..ehdr.phnum {
        let phdr = parse_phdr(source, &ehdr, index)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        load_segment(source, &phdr)?;
    }

    Ok(VirtAddr::new(ehdr.entry as usize))
}

fn load_segment(source: &impl ElfSource, phdr: &Phdr) -> Result<()> {
    if phdr.memsz < phdr.filesz {
        return Err(Error::BadFormat);
    }
    if phdr.memsz == 0 {
        return Ok(());
    }
    let vaddr = phdr.vaddr as usize;
    let end = vaddr
        .checked_add(phdr.memsz as usize)
        .ok_or(Error::BadFormat)?;
    if vaddr < UMEM_START_VMA || end > UMEM_END_VMA {
        return Err(Error::BadFormat);
    }

    // Map the page-rounded extent writable for the fill, then drop to
    // the segment's own permissions. Overlapping segments surface as
    // Busy from the mapper and condemn the image.
    let start = VirtAddr::new(vaddr).page_round_down();
    let size = end - start.as_usize();
    alloc_and_map_range(start, size, PteFlags::R | PteFlags::W).map_err(|err| match err {
        Error::Busy => Error::BadFormat,
        other => other,
    })?;

    unsafe {
        // Zero the whole extent (page padding and BSS tail included),
        // then lay the file bytes over it.
        let pages = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        core::ptr::write_bytes(start.as_usize() as *mut u8, 0, pages);
        let dst = core::slice::from_raw_parts_mut(vaddr as *mut u8, phdr.filesz as usize);
        read_exact(source, phdr.offset, dst)?;
    }

    set_range_flags(start, size, segment_flags(phdr.flags));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Image(Vec<u8>);

    impl ElfSource for Image {
        fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            let pos = pos as usize;
            if pos >= self.0.len() {
                return Ok(0);
            }
            let take = buf.len().min(self.0.len() - pos);
            buf[..take].copy_from_slice(&self.0[pos..pos + take]);
            Ok(take)
        }
    }

    /// A minimal valid header with one program header of `p_type`.
    fn image(p_type: u32) -> Image {
        let mut bytes = vec![0u8; EHDR_SIZE + PHDR_SIZE];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[EI_CLASS] = ELFCLASS64;
        bytes[EI_DATA] = ELFDATA2LSB;
        bytes[EI_VERSION] = EV_CURRENT;
        bytes[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        bytes[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
        bytes[24..32].copy_from_slice(&(0xC000_0000u64).to_le_bytes()); // entry
        bytes[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // phoff
        bytes[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        bytes[56..58].copy_from_slice(&1u16.to_le_bytes());
        bytes[EHDR_SIZE..EHDR_SIZE + 4].copy_from_slice(&p_type.to_le_bytes());
        Image(bytes)
    }

    #[test]
    fn accepts_a_well_formed_header() {
        // PT_NULL segment: nothing to map, so load completes on the host.
        let entry = load(&image(0)).unwrap();
        assert_eq!(entry.as_usize(), 0xC000_0000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut img = image(0);
        img.0[1] = b'F';
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_wrong_class_and_endianness() {
        let mut img = image(0);
        img.0[EI_CLASS] = 1; // ELFCLASS32
        assert_eq!(load(&img).err(), Some(Error::BadFormat));

        let mut img = image(0);
        img.0[EI_DATA] = 2; // big-endian
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_wrong_machine_and_type() {
        let mut img = image(0);
        img.0[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        assert_eq!(load(&img).err(), Some(Error::BadFormat));

        let mut img = image(0);
        img.0[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_entry_outside_user_window() {
        let mut img = image(0);
        img.0[24..32].copy_from_slice(&(0x8000_0000u64).to_le_bytes());
        assert_eq!(load(&img).err(), Some(Error::BadFormat));

        let mut img = image(0);
        img.0[24..32].copy_from_slice(&(UMEM_END_VMA as u64).to_le_bytes());
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_unreasonable_phdr_tables() {
        let mut img = image(0);
        img.0[56..58].copy_from_slice(&0u16.to_le_bytes()); // no headers
        assert_eq!(load(&img).err(), Some(Error::BadFormat));

        let mut img = image(0);
        img.0[56..58].copy_from_slice(&500u16.to_le_bytes()); // too many
        assert_eq!(load(&img).err(), Some(Error::BadFormat));

        let mut img = image(0);
        img.0[54..56].copy_from_slice(&32u16.to_le_bytes()); // wrong phentsize
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_truncated_images() {
        let mut img = image(0);
        img.0.truncate(EHDR_SIZE + 10); // phdr table cut short
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_segment_with_memsz_below_filesz() {
        let mut img = image(PT_LOAD);
        let p = EHDR_SIZE;
        img.0[p + 32..p + 40].copy_from_slice(&100u64.to_le_bytes()); // filesz
        img.0[p + 40..p + 48].copy_from_slice(&50u64.to_le_bytes()); // memsz
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }

    #[test]
    fn rejects_segment_outside_user_window() {
        let mut img = image(PT_LOAD);
        let p = EHDR_SIZE;
        img.0[p + 16..p + 24].copy_from_slice(&(0x8000_0000u64).to_le_bytes());
        img.0[p + 32..p + 40].copy_from_slice(&8u64.to_le_bytes());
        img.0[p + 40..p + 48].copy_from_slice(&8u64.to_le_bytes());
        assert_eq!(load(&img).err(), Some(Error::BadFormat));
    }
}
