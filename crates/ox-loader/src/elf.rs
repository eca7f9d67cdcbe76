//! ELF32 big-endian PowerPC images

use ox_core::error::LoaderError;
use ox_memory::{MemoryManager, PageFlags};
use std::io::{Cursor, Read, Seek, SeekFrom};
use tracing::{debug, info};

/// ELF program header type for loadable segments
pub const PT_LOAD: u32 = 1;
/// e_machine for PowerPC
pub const EM_PPC: u16 = 20;

/// ELF file header (32-bit)
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

/// ELF program header (32-bit)
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// A loaded ELF image. Loading is single-phase.
#[derive(Debug)]
pub struct ElfModule {
    name: String,
    path: String,
    header: Elf32Header,
    phdrs: Vec<Elf32Phdr>,
    low_address: u32,
    high_address: u32,
}

impl ElfModule {
    /// Parse `data` and copy its loadable segments into guest memory
    pub fn load(
        name: &str,
        path: &str,
        data: &[u8],
        memory: &MemoryManager,
    ) -> Result<Self, LoaderError> {
        let mut reader = Cursor::new(data);
        let header = Self::parse_header(&mut reader)?;
        let phdrs = Self::parse_phdrs(&mut reader, &header)?;

        let mut module = Self {
            name: name.to_string(),
            path: path.to_string(),
            header,
            phdrs,
            low_address: u32::MAX,
            high_address: 0,
        };

        for (index, phdr) in module.phdrs.clone().iter().enumerate() {
            if phdr.p_type == PT_LOAD {
                module.load_segment(data, memory, phdr, index)?;
            }
        }
        if module.low_address > module.high_address {
            module.low_address = 0;
        }

        info!(
            "ELF {} loaded: entry=0x{:08x}, phdrs={}",
            module.name,
            header.e_entry,
            module.phdrs.len()
        );
        Ok(module)
    }

    fn load_segment(
        &mut self,
        data: &[u8],
        memory: &MemoryManager,
        phdr: &Elf32Phdr,
        index: usize,
    ) -> Result<(), LoaderError> {
        debug!(
            "Loading segment {}: vaddr=0x{:08x}, filesz=0x{:x}, memsz=0x{:x}",
            index, phdr.p_vaddr, phdr.p_filesz, phdr.p_memsz
        );

        let size = phdr.p_memsz.max(phdr.p_filesz);
        if size == 0 {
            return Ok(());
        }
        let end = phdr.p_vaddr.checked_add(size).ok_or_else(|| {
            LoaderError::InvalidElf(format!(
                "segment {} at 0x{:08x} wraps the address space",
                index, phdr.p_vaddr
            ))
        })?;

        let file_end = phdr.p_offset as usize + phdr.p_filesz as usize;
        let contents = data.get(phdr.p_offset as usize..file_end).ok_or_else(|| {
            LoaderError::InvalidElf(format!(
                "segment {} extends beyond file: ends at 0x{:x} but file is 0x{:x} bytes",
                index,
                file_end,
                data.len()
            ))
        })?;

        let mut flags = PageFlags::READ;
        if phdr.p_flags & 0x2 != 0 {
            flags |= PageFlags::WRITE;
        }
        if phdr.p_flags & 0x1 != 0 {
            flags |= PageFlags::EXECUTE;
        }

        // Pages need to be writable while the segment is copied in
        memory.commit(phdr.p_vaddr, size, flags | PageFlags::WRITE)?;
        memory.write_bytes(phdr.p_vaddr, contents)?;
        if phdr.p_memsz > phdr.p_filesz {
            memory.fill(
                phdr.p_vaddr + phdr.p_filesz,
                phdr.p_memsz - phdr.p_filesz,
                0,
            )?;
        }
        if !flags.contains(PageFlags::WRITE) {
            memory.commit(phdr.p_vaddr, size, flags)?;
        }

        self.low_address = self.low_address.min(phdr.p_vaddr);
        self.high_address = self.high_address.max(end);
        Ok(())
    }

    /// Parse ELF header from reader
    pub fn parse_header<R: Read + Seek>(reader: &mut R) -> Result<Elf32Header, LoaderError> {
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| LoaderError::InvalidElf(format!("Failed to seek to file start: {}", e)))?;

        let mut header = Elf32Header::default();
        reader
            .read_exact(&mut header.e_ident)
            .map_err(|e| LoaderError::InvalidElf(format!("Failed to read ELF ident: {}", e)))?;

        if header.e_ident[0..4] != [0x7F, b'E', b'L', b'F'] {
            return Err(LoaderError::InvalidElf("Invalid ELF magic bytes".into()));
        }
        if header.e_ident[4] != 1 {
            return Err(LoaderError::InvalidElf(format!(
                "Not a 32-bit ELF: class={} (expected 1 for ELFCLASS32)",
                header.e_ident[4]
            )));
        }
        if header.e_ident[5] != 2 {
            return Err(LoaderError::InvalidElf(format!(
                "Not big-endian ELF: data encoding={} (expected 2 for ELFDATA2MSB)",
                header.e_ident[5]
            )));
        }

        let mut buf = [0u8; 36];
        reader
            .read_exact(&mut buf)
            .map_err(|e| LoaderError::InvalidElf(format!("Failed to read ELF header: {}", e)))?;

        header.e_type = u16::from_be_bytes([buf[0], buf[1]]);
        header.e_machine = u16::from_be_bytes([buf[2], buf[3]]);
        header.e_version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        header.e_entry = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        header.e_phoff = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        header.e_shoff = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        header.e_flags = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        header.e_ehsize = u16::from_be_bytes([buf[24], buf[25]]);
        header.e_phentsize = u16::from_be_bytes([buf[26], buf[27]]);
        header.e_phnum = u16::from_be_bytes([buf[28], buf[29]]);

        if header.e_machine != EM_PPC {
            return Err(LoaderError::InvalidElf(format!(
                "Unsupported machine {} (expected {} for PowerPC)",
                header.e_machine, EM_PPC
            )));
        }
        Ok(header)
    }

    pub fn parse_phdrs<R: Read + Seek>(
        reader: &mut R,
        header: &Elf32Header,
    ) -> Result<Vec<Elf32Phdr>, LoaderError> {
        let mut phdrs = Vec::with_capacity(header.e_phnum as usize);
        for i in 0..header.e_phnum as u64 {
            let offset = header.e_phoff as u64 + i * header.e_phentsize.max(32) as u64;
            reader.seek(SeekFrom::Start(offset)).map_err(|e| {
                LoaderError::InvalidElf(format!("Failed to seek to phdr {}: {}", i, e))
            })?;
            let mut buf = [0u8; 32];
            reader.read_exact(&mut buf).map_err(|e| {
                LoaderError::InvalidElf(format!("Failed to read phdr {} at 0x{:x}: {}", i, offset, e))
            })?;
            let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            phdrs.push(Elf32Phdr {
                p_type: word(0),
                p_offset: word(4),
                p_vaddr: word(8),
                p_paddr: word(12),
                p_filesz: word(16),
                p_memsz: word(20),
                p_flags: word(24),
                p_align: word(28),
            });
        }
        Ok(phdrs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entry_point(&self) -> u32 {
        self.header.e_entry
    }

    pub fn low_address(&self) -> u32 {
        self.low_address
    }

    pub fn high_address(&self) -> u32 {
        self.high_address
    }
}

/// Build a minimal ELF32 big-endian PowerPC image with one loadable segment
pub fn build_test_elf(entry: u32, vaddr: u32, code: &[u8], bss: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 1, 2, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&2u16.to_be_bytes()); // ET_EXEC
    out.extend_from_slice(&EM_PPC.to_be_bytes());
    out.extend_from_slice(&1u32.to_be_bytes());
    out.extend_from_slice(&entry.to_be_bytes());
    out.extend_from_slice(&52u32.to_be_bytes()); // e_phoff
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&52u16.to_be_bytes());
    out.extend_from_slice(&32u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);

    let code_offset = 52 + 32;
    for word in [
        PT_LOAD,
        code_offset,
        vaddr,
        vaddr,
        code.len() as u32,
        code.len() as u32 + bss,
        0x5,
        0x1000,
    ] {
        out.extend_from_slice(&word.to_be_bytes());
    }
    out.extend_from_slice(code);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_segments() {
        let memory = MemoryManager::new();
        let data = build_test_elf(0x8200_0010, 0x8200_0000, &[0x60, 0, 0, 0, 0x4E, 0x80, 0, 0x20], 0x100);
        let module = ElfModule::load("test.elf", "game:\\test.elf", &data, &memory).unwrap();

        assert_eq!(module.entry_point(), 0x8200_0010);
        assert_eq!(memory.read_be32(0x8200_0004).unwrap(), 0x4E80_0020);
        assert_eq!(memory.read_be32(0x8200_0100).unwrap(), 0);
        // Read-execute segment ends up write protected
        assert!(memory.write_be32(0x8200_0000, 0).is_err());
        assert_eq!(module.low_address(), 0x8200_0000);
        assert_eq!(module.high_address(), 0x8200_0108);
    }

    #[test]
    fn test_rejects_wrong_class() {
        let memory = MemoryManager::new();
        let mut data = build_test_elf(0, 0x8200_0000, &[0; 4], 0);
        data[4] = 2;
        assert!(matches!(
            ElfModule::load("x", "x", &data, &memory),
            Err(LoaderError::InvalidElf(_))
        ));
    }
}
