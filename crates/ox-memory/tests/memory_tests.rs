//! Address space and snapshot tests for the guest memory manager

use ox_core::{ByteReader, ByteWriter};
use ox_memory::{constants::*, MemoryManager, PageFlags};
use std::sync::Arc;
use std::thread;

#[test]
fn test_snapshot_restores_pages_and_heap() {
    let mem = MemoryManager::new();
    mem.commit(0x8200_0000, 0x3000, PageFlags::RWX).unwrap();
    mem.write_be32(0x8200_1000, 0xCAFE_BABE).unwrap();
    let heap_addr = mem.system_heap_alloc(0x40).unwrap();
    mem.write_be32(heap_addr, 0x1234_5678).unwrap();

    let mut writer = ByteWriter::with_capacity_limit(1 << 24);
    mem.save(&mut writer).unwrap();
    let blob = writer.into_inner();

    let restored = MemoryManager::new();
    restored.commit(0x9000_0000, 0x1000, PageFlags::RW).unwrap();
    let mut reader = ByteReader::new(&blob);
    restored.restore(&mut reader).unwrap();
    assert_eq!(reader.remaining(), 0);

    // Pages that were not in the snapshot are gone
    assert!(!restored.is_committed(0x9000_0000));
    assert_eq!(restored.committed_pages(), mem.committed_pages());
    assert_eq!(restored.read_be32(0x8200_1000).unwrap(), 0xCAFE_BABE);
    assert_eq!(restored.read_be32(heap_addr).unwrap(), 0x1234_5678);

    // The heap cursor carried over, so the next allocation does not alias
    let next = restored.system_heap_alloc(0x10).unwrap();
    assert!(next >= heap_addr + 0x40);
}

#[test]
fn test_restore_rejects_foreign_blob() {
    let mem = MemoryManager::new();
    let blob = 0xDEAD_BEEFu32.to_le_bytes();
    let mut reader = ByteReader::new(&blob);
    assert!(mem.restore(&mut reader).is_err());
}

#[test]
fn test_reset_clears_everything() {
    let mem = MemoryManager::new();
    mem.system_heap_alloc(0x2000).unwrap();
    mem.stack_alloc(0x4000).unwrap();
    assert!(mem.committed_pages() > 0);

    mem.reset();
    assert_eq!(mem.committed_pages(), 0);
    assert_eq!(mem.system_heap_used(), 0);
    assert_eq!(mem.system_heap_alloc(0x10).unwrap(), SYSTEM_HEAP_BASE);
}

#[test]
fn test_decommit() {
    let mem = MemoryManager::new();
    mem.commit(0x8200_0000, 0x2000, PageFlags::RW).unwrap();
    mem.decommit(0x8200_1000, 0x1000).unwrap();
    assert!(mem.is_committed(0x8200_0000));
    assert!(!mem.is_committed(0x8200_1000));
}

#[test]
fn test_concurrent_heap_allocations_are_distinct() {
    let mem = MemoryManager::new();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let mem = Arc::clone(&mem);
            thread::spawn(move || {
                (0..16)
                    .map(|_| mem.system_heap_alloc(0x20).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 64);
}
