//! Page flags

use crate::constants::PAGE_SIZE;
use bitflags::bitflags;

bitflags! {
    /// Page protection flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Page is readable
        const READ    = 0b0000_0001;
        /// Page is writable
        const WRITE   = 0b0000_0010;
        /// Page is executable
        const EXECUTE = 0b0000_0100;

        /// Read and write access
        const RW  = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Read and execute access
        const RX  = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Align address down to a page boundary
pub fn align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Align a size up to a whole number of pages
pub fn align_up(size: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    (size + page - 1) & !(page - 1)
}
