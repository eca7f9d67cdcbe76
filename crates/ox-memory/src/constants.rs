//! Guest address space layout

/// Standard page size
pub const PAGE_SIZE: u32 = 0x1000;

/// Virtual heap for thread stacks
pub const STACK_HEAP_BASE: u32 = 0x7000_0000;
pub const STACK_HEAP_SIZE: u32 = 0x0F00_0000;

/// Virtual heap for kernel-owned structures (XEX headers, loader data)
pub const SYSTEM_HEAP_BASE: u32 = 0x8000_0000;
pub const SYSTEM_HEAP_SIZE: u32 = 0x0100_0000;

/// Snapshot blob marker ("MEMS")
pub const MEMORY_SNAPSHOT_MAGIC: u32 = 0x4D45_4D53;
