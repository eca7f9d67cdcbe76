//! Host-trapped faults

/// Kind of fault reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// Invalid memory access at the given host address
    AccessViolation { fault_address: u64 },
    /// Illegal or trapping instruction
    IllegalInstruction,
}

/// A fault trapped on a host thread.
///
/// `pc` is a host program counter; it only maps back to guest code when it
/// lies inside the backend's code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostException {
    pub pc: u64,
    pub code: ExceptionCode,
}

impl HostException {
    pub fn new(pc: u64, code: ExceptionCode) -> Self {
        Self { pc, code }
    }
}
