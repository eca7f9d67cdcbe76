//! Bump heaps carved out of the guest address space

use ox_core::error::MemoryError;

/// A contiguous guest range handing out addresses in allocation order.
///
/// Frees are not tracked; kernel structures and stacks live until the
/// title is torn down, at which point the heap is reset.
#[derive(Debug, Clone)]
pub struct Heap {
    name: &'static str,
    base: u32,
    size: u32,
    cursor: u32,
}

impl Heap {
    pub fn new(name: &'static str, base: u32, size: u32) -> Self {
        Self {
            name,
            base,
            size,
            cursor: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    /// Bytes handed out so far
    pub fn used(&self) -> u32 {
        self.cursor
    }

    /// Reserve `size` bytes aligned to `align` (a power of two)
    pub fn alloc(&mut self, size: u32, align: u32) -> Result<u32, MemoryError> {
        let align = align.max(1);
        let start = (self.cursor as u64 + align as u64 - 1) & !(align as u64 - 1);
        let end = start + size.max(1) as u64;
        if end > self.size as u64 {
            tracing::error!(
                "{} heap exhausted allocating {:#x} bytes ({:#x} used)",
                self.name,
                size,
                self.cursor
            );
            return Err(MemoryError::OutOfMemory);
        }
        self.cursor = end as u32;
        Ok(self.base + start as u32)
    }

    /// Whether `addr` lies inside this heap's range
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.size
    }

    pub(crate) fn set_used(&mut self, used: u32) {
        self.cursor = used.min(self.size);
    }

    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_alignment() {
        let mut heap = Heap::new("test", 0x8000_0000, 0x1000);
        assert_eq!(heap.alloc(3, 4).unwrap(), 0x8000_0000);
        assert_eq!(heap.alloc(8, 16).unwrap(), 0x8000_0010);
        assert_eq!(heap.used(), 0x18);
    }

    #[test]
    fn test_heap_exhaustion() {
        let mut heap = Heap::new("test", 0x8000_0000, 0x100);
        assert!(heap.alloc(0x100, 1).is_ok());
        assert_eq!(heap.alloc(1, 1), Err(MemoryError::OutOfMemory));
    }
}
