//! Memory manager implementation

use crate::constants::*;
use crate::heap::Heap;
use crate::pages::{align_down, align_up, PageFlags};
use ox_core::error::{AccessKind, MemoryError, SnapshotError};
use ox_core::{ByteReader, ByteWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One committed guest page
struct Page {
    flags: PageFlags,
    data: Box<[u8]>,
}

impl Page {
    fn new(flags: PageFlags) -> Self {
        Self {
            flags,
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }
}

/// Main memory manager for the guest
///
/// The 4 GiB guest space is sparse: only committed pages are backed by
/// host memory. All multi-byte accessors are big-endian, matching the
/// guest CPU.
pub struct MemoryManager {
    pages: RwLock<BTreeMap<u32, Page>>,
    system_heap: Mutex<Heap>,
    stack_heap: Mutex<Heap>,
}

impl MemoryManager {
    /// Create a new memory manager
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: RwLock::new(BTreeMap::new()),
            system_heap: Mutex::new(Heap::new("system", SYSTEM_HEAP_BASE, SYSTEM_HEAP_SIZE)),
            stack_heap: Mutex::new(Heap::new("stack", STACK_HEAP_BASE, STACK_HEAP_SIZE)),
        })
    }

    /// Commit the pages covering `[addr, addr + size)`.
    ///
    /// Already committed pages keep their contents and take the new flags.
    pub fn commit(&self, addr: u32, size: u32, flags: PageFlags) -> Result<(), MemoryError> {
        let (first, count) = Self::page_span(addr, size)?;
        let mut pages = self.pages.write();
        for index in first..first + count {
            pages
                .entry(index)
                .and_modify(|page| page.flags = flags)
                .or_insert_with(|| Page::new(flags));
        }
        tracing::trace!(
            "Committed {} pages at 0x{:08x} ({:?})",
            count,
            first * PAGE_SIZE,
            flags
        );
        Ok(())
    }

    /// Release the pages covering `[addr, addr + size)`
    pub fn decommit(&self, addr: u32, size: u32) -> Result<(), MemoryError> {
        let (first, count) = Self::page_span(addr, size)?;
        let mut pages = self.pages.write();
        for index in first..first + count {
            pages.remove(&index);
        }
        Ok(())
    }

    /// Whether the page containing `addr` is committed
    pub fn is_committed(&self, addr: u32) -> bool {
        self.pages.read().contains_key(&(addr / PAGE_SIZE))
    }

    /// Number of committed pages
    pub fn committed_pages(&self) -> usize {
        self.pages.read().len()
    }

    fn page_span(addr: u32, size: u32) -> Result<(u32, u32), MemoryError> {
        let start = align_down(addr) as u64;
        let end = align_up(addr as u64 + size.max(1) as u64);
        if end > 1u64 << 32 {
            return Err(MemoryError::InvalidAddress(addr));
        }
        let first = (start / PAGE_SIZE as u64) as u32;
        let count = ((end - start) / PAGE_SIZE as u64) as u32;
        Ok((first, count))
    }

    /// Check if memory access is valid
    pub fn check_access(&self, addr: u32, size: u32, required: PageFlags) -> Result<(), MemoryError> {
        let (first, count) = Self::page_span(addr, size)?;
        let kind = if required.contains(PageFlags::WRITE) {
            AccessKind::Write
        } else if required.contains(PageFlags::EXECUTE) {
            AccessKind::Execute
        } else {
            AccessKind::Read
        };

        let pages = self.pages.read();
        for index in first..first + count {
            match pages.get(&index) {
                Some(page) if page.flags.contains(required) => {}
                Some(_) => {
                    return Err(MemoryError::AccessViolation {
                        addr: index * PAGE_SIZE,
                        kind,
                    })
                }
                None => return Err(MemoryError::InvalidAddress(index * PAGE_SIZE)),
            }
        }
        Ok(())
    }

    /// Copy guest bytes into `out`
    pub fn read_into(&self, addr: u32, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check_access(addr, out.len() as u32, PageFlags::READ)?;
        let pages = self.pages.read();
        let mut done = 0usize;
        while done < out.len() {
            let cur = addr.wrapping_add(done as u32);
            let page = pages
                .get(&(cur / PAGE_SIZE))
                .ok_or(MemoryError::InvalidAddress(cur))?;
            let offset = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(out.len() - done);
            out[done..done + chunk].copy_from_slice(&page.data[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Read `size` bytes starting at `addr`
    pub fn read_bytes(&self, addr: u32, size: u32) -> Result<Vec<u8>, MemoryError> {
        let mut out = vec![0u8; size as usize];
        self.read_into(addr, &mut out)?;
        Ok(out)
    }

    /// Write bytes starting at `addr`
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        self.check_access(addr, data.len() as u32, PageFlags::WRITE)?;
        let mut pages = self.pages.write();
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr.wrapping_add(done as u32);
            let page = pages
                .get_mut(&(cur / PAGE_SIZE))
                .ok_or(MemoryError::InvalidAddress(cur))?;
            let offset = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(data.len() - done);
            page.data[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Fill `size` bytes at `addr` with `value`
    pub fn fill(&self, addr: u32, size: u32, value: u8) -> Result<(), MemoryError> {
        self.write_bytes(addr, &vec![value; size as usize])
    }

    pub fn read_be16(&self, addr: u32) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn write_be16(&self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    pub fn read_be32(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn write_be32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    pub fn read_be64(&self, addr: u32) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn write_be64(&self, addr: u32, value: u64) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    /// Allocate and commit zeroed memory from the system heap
    pub fn system_heap_alloc(&self, size: u32) -> Result<u32, MemoryError> {
        let addr = self.system_heap.lock().alloc(size, 0x10)?;
        self.commit(addr, size, PageFlags::RW)?;
        Ok(addr)
    }

    /// Allocate and commit a thread stack, returning its lowest address
    pub fn stack_alloc(&self, size: u32) -> Result<u32, MemoryError> {
        let addr = self.stack_heap.lock().alloc(size, PAGE_SIZE)?;
        self.commit(addr, size, PageFlags::RW)?;
        Ok(addr)
    }

    /// Bytes currently handed out by the system heap
    pub fn system_heap_used(&self) -> u32 {
        self.system_heap.lock().used()
    }

    /// Drop every page and reset the heaps
    pub fn reset(&self) {
        self.pages.write().clear();
        self.system_heap.lock().reset();
        self.stack_heap.lock().reset();
    }

    /// Append all committed pages and heap cursors to a snapshot
    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(MEMORY_SNAPSHOT_MAGIC)?;
        stream.write_u32(self.system_heap.lock().used())?;
        stream.write_u32(self.stack_heap.lock().used())?;

        let pages = self.pages.read();
        stream.write_u32(pages.len() as u32)?;
        for (index, page) in pages.iter() {
            stream.write_u32(*index)?;
            stream.write_u32(page.flags.bits())?;
            stream.write_bytes(&page.data)?;
        }

        tracing::debug!("Saved {} guest pages", pages.len());
        Ok(())
    }

    /// Replace the whole address space with the contents of a snapshot
    pub fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError> {
        let magic = stream.read_u32()?;
        if magic != MEMORY_SNAPSHOT_MAGIC {
            return Err(SnapshotError::Invalid(format!(
                "memory blob marker 0x{:08x}",
                magic
            )));
        }
        let system_used = stream.read_u32()?;
        let stack_used = stream.read_u32()?;
        let count = stream.read_u32()?;

        let mut restored = BTreeMap::new();
        for _ in 0..count {
            let index = stream.read_u32()?;
            let flags = PageFlags::from_bits_truncate(stream.read_u32()?);
            let data = stream.read_bytes(PAGE_SIZE as usize)?;
            restored.insert(
                index,
                Page {
                    flags,
                    data: data.to_vec().into_boxed_slice(),
                },
            );
        }

        *self.pages.write() = restored;
        self.system_heap.lock().set_used(system_used);
        self.stack_heap.lock().set_used(stack_used);

        tracing::debug!("Restored {} guest pages", count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncommitted_access_fails() {
        let mem = MemoryManager::new();
        assert_eq!(
            mem.read_be32(0x8200_0000),
            Err(MemoryError::InvalidAddress(0x8200_0000))
        );
    }

    #[test]
    fn test_big_endian_accessors() {
        let mem = MemoryManager::new();
        mem.commit(0x8200_0000, 0x1000, PageFlags::RW).unwrap();
        mem.write_be32(0x8200_0010, 0x1122_3344).unwrap();
        assert_eq!(mem.read_bytes(0x8200_0010, 4).unwrap(), vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(mem.read_be16(0x8200_0012).unwrap(), 0x3344);
    }

    #[test]
    fn test_cross_page_write() {
        let mem = MemoryManager::new();
        mem.commit(0x8200_0000, 0x2000, PageFlags::RW).unwrap();
        mem.write_be64(0x8200_0FFC, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(mem.read_be64(0x8200_0FFC).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_write_protection() {
        let mem = MemoryManager::new();
        mem.commit(0x8200_0000, 0x1000, PageFlags::RX).unwrap();
        assert!(matches!(
            mem.write_be32(0x8200_0000, 1),
            Err(MemoryError::AccessViolation { kind: AccessKind::Write, .. })
        ));
    }

    #[test]
    fn test_system_heap_alloc_is_committed() {
        let mem = MemoryManager::new();
        let addr = mem.system_heap_alloc(0x64).unwrap();
        assert_eq!(addr, SYSTEM_HEAP_BASE);
        assert!(mem.is_committed(addr));
        assert_eq!(mem.read_be32(addr + 0x60).unwrap(), 0);
    }
}
