//! Memory management for oxidized-xenon
//!
//! This crate provides the 32-bit big-endian guest address space: pages
//! are committed on demand, heaps hand out guest addresses for kernel
//! structures and thread stacks, and the whole space can be written to and
//! restored from a machine snapshot.

pub mod constants;
pub mod heap;
pub mod manager;
pub mod pages;

pub use constants::*;
pub use heap::Heap;
pub use manager::MemoryManager;
pub use pages::PageFlags;
