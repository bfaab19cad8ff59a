//! ELF32 executable loader
//!
//! Programs in the RAM disk are statically linked ELF32 executables.
//! The loader validates the header and digests the section table into a
//! flat description of the four segments exec cares about: text, data,
//! rodata and bss.

use crate::errors::{KernError, KernResult};
use crate::types::VAddr;

// ============================================================================
// ELF Constants
// ============================================================================

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// ELF class - 32-bit
pub const ELFCLASS32: u8 = 1;
/// ELF data encoding - little endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF type - executable
pub const ET_EXEC: u16 = 2;
/// ELF machine - Intel 386
pub const EM_386: u16 = 3;

const EHDR_SIZE: usize = 52;
const SHDR_SIZE: usize = 40;

// ============================================================================
// Digested Header
// ============================================================================

/// What exec needs to know about an executable: where each segment
/// lives in the file, where it goes in memory, and the entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleElf {
    /// Entry point virtual address
    pub entry: VAddr,
    pub txt_off: usize,
    pub txt_start: VAddr,
    pub txt_len: usize,
    pub dat_off: usize,
    pub dat_start: VAddr,
    pub dat_len: usize,
    pub rodat_off: usize,
    pub rodat_start: VAddr,
    pub rodat_len: usize,
    pub bss_start: VAddr,
    pub bss_len: usize,
}

// ============================================================================
// Parsing
// ============================================================================

fn read_u16(bytes: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(bytes.get(off..off + 2)?.try_into().ok()?))
}

fn read_u32(bytes: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(off..off + 4)?.try_into().ok()?))
}

/// Is this a well-formed ELF32 executable for this machine?
pub fn elf_check_header(bytes: &[u8]) -> KernResult<()> {
    if bytes.len() < EHDR_SIZE {
        return Err(KernError::ElfInvalid);
    }
    if bytes[0..4] != ELF_MAGIC {
        return Err(KernError::ElfInvalid);
    }
    if bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2LSB {
        return Err(KernError::ElfInvalid);
    }
    let e_type = read_u16(bytes, 16).ok_or(KernError::ElfInvalid)?;
    let e_machine = read_u16(bytes, 18).ok_or(KernError::ElfInvalid)?;
    if e_type != ET_EXEC || e_machine != EM_386 {
        return Err(KernError::ElfInvalid);
    }
    Ok(())
}

/// Digest the section table into a [`SimpleElf`]. Sections the kernel
/// does not load (symbols, debug info) are ignored.
pub fn elf_load_helper(bytes: &[u8]) -> KernResult<SimpleElf> {
    elf_check_header(bytes)?;

    let e_entry = read_u32(bytes, 24).ok_or(KernError::ElfLoadFail)?;
    let e_shoff = read_u32(bytes, 32).ok_or(KernError::ElfLoadFail)? as usize;
    let e_shentsize = read_u16(bytes, 46).ok_or(KernError::ElfLoadFail)? as usize;
    let e_shnum = read_u16(bytes, 48).ok_or(KernError::ElfLoadFail)? as usize;
    let e_shstrndx = read_u16(bytes, 50).ok_or(KernError::ElfLoadFail)? as usize;

    if e_shentsize < SHDR_SIZE || e_shstrndx >= e_shnum {
        return Err(KernError::ElfLoadFail);
    }

    let shdr = |idx: usize| -> KernResult<(u32, u32, u32, u32)> {
        let base = e_shoff + idx * e_shentsize;
        let name = read_u32(bytes, base).ok_or(KernError::ElfLoadFail)?;
        let addr = read_u32(bytes, base + 12).ok_or(KernError::ElfLoadFail)?;
        let offset = read_u32(bytes, base + 16).ok_or(KernError::ElfLoadFail)?;
        let size = read_u32(bytes, base + 20).ok_or(KernError::ElfLoadFail)?;
        Ok((name, addr, offset, size))
    };

    // The section name string table.
    let (_, _, strtab_off, strtab_size) = shdr(e_shstrndx)?;
    let strtab = bytes
        .get(strtab_off as usize..(strtab_off + strtab_size) as usize)
        .ok_or(KernError::ElfLoadFail)?;
    let section_name = |name_off: u32| -> &[u8] {
        let start = name_off as usize;
        let mut end = start;
        while end < strtab.len() && strtab[end] != 0 {
            end += 1;
        }
        strtab.get(start..end).unwrap_or(b"")
    };

    let mut elf = SimpleElf {
        entry: e_entry,
        ..Default::default()
    };

    for idx in 0..e_shnum {
        let (name_off, addr, offset, size) = shdr(idx)?;
        match section_name(name_off) {
            b".text" => {
                elf.txt_start = addr;
                elf.txt_off = offset as usize;
                elf.txt_len = size as usize;
            }
            b".data" => {
                elf.dat_start = addr;
                elf.dat_off = offset as usize;
                elf.dat_len = size as usize;
            }
            b".rodata" => {
                elf.rodat_start = addr;
                elf.rodat_off = offset as usize;
                elf.rodat_len = size as usize;
            }
            b".bss" => {
                elf.bss_start = addr;
                elf.bss_len = size as usize;
            }
            _ => {}
        }
    }

    if elf.txt_len == 0 || elf.entry == 0 {
        return Err(KernError::ElfLoadFail);
    }
    Ok(elf)
}

// ============================================================================
// Test Image Builder
// ============================================================================

/// Assemble a minimal ELF32 executable image for tests: a text section
/// plus optional data and bss.
#[cfg(test)]
pub fn build_test_image(
    entry: VAddr,
    txt_start: VAddr,
    text: &[u8],
    dat_start: VAddr,
    data: &[u8],
    bss_start: VAddr,
    bss_len: usize,
) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    let mut image = Vec::new();

    // Section bodies come right after the ELF header.
    let txt_off = EHDR_SIZE;
    let dat_off = txt_off + text.len();
    let strtab_off = dat_off + data.len();
    let strtab: &[u8] = b"\0.text\0.data\0.bss\0.shstrtab\0";
    let shoff = strtab_off + strtab.len();

    // ELF header.
    image.extend_from_slice(&ELF_MAGIC);
    image.extend_from_slice(&[ELFCLASS32, ELFDATA2LSB, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&ET_EXEC.to_le_bytes());
    image.extend_from_slice(&EM_386.to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes()); // version
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // phoff
    image.extend_from_slice(&(shoff as u32).to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // flags
    image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&0u16.to_le_bytes()); // phentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // phnum
    image.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    image.extend_from_slice(&5u16.to_le_bytes()); // shnum
    image.extend_from_slice(&4u16.to_le_bytes()); // shstrndx

    image.extend_from_slice(text);
    image.extend_from_slice(data);
    image.extend_from_slice(strtab);

    let mut shdr = |name: u32, addr: u32, off: u32, size: u32| {
        image.extend_from_slice(&name.to_le_bytes());
        image.extend_from_slice(&1u32.to_le_bytes()); // type PROGBITS
        image.extend_from_slice(&0u32.to_le_bytes()); // flags
        image.extend_from_slice(&addr.to_le_bytes());
        image.extend_from_slice(&off.to_le_bytes());
        image.extend_from_slice(&size.to_le_bytes());
        image.extend_from_slice(&[0u8; 16]); // link/info/align/entsize
    };

    shdr(0, 0, 0, 0); // null section
    shdr(1, txt_start, txt_off as u32, text.len() as u32); // .text
    shdr(7, dat_start, dat_off as u32, data.len() as u32); // .data
    shdr(13, bss_start, 0, bss_len as u32); // .bss
    shdr(18, 0, strtab_off as u32, strtab.len() as u32); // .shstrtab

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(elf_check_header(b"nope").unwrap_err(), KernError::ElfInvalid);
        let mut bad = build_test_image(0x0100_0000, 0x0100_0000, b"xx", 0, b"", 0, 0);
        bad[4] = 2; // 64-bit class
        assert_eq!(elf_check_header(&bad).unwrap_err(), KernError::ElfInvalid);
    }

    #[test]
    fn test_digests_sections() {
        let image = build_test_image(
            0x0100_0020,
            0x0100_0000,
            b"codecodecode",
            0x0100_2000,
            b"data",
            0x0100_3000,
            256,
        );
        let elf = elf_load_helper(&image).unwrap();
        assert_eq!(elf.entry, 0x0100_0020);
        assert_eq!(elf.txt_start, 0x0100_0000);
        assert_eq!(elf.txt_len, 12);
        assert_eq!(elf.dat_start, 0x0100_2000);
        assert_eq!(elf.dat_len, 4);
        assert_eq!(elf.bss_start, 0x0100_3000);
        assert_eq!(elf.bss_len, 256);
        // The section bodies are where the header says.
        assert_eq!(&image[elf.txt_off..elf.txt_off + 4], b"code");
        assert_eq!(&image[elf.dat_off..elf.dat_off + 4], b"data");
    }
}
