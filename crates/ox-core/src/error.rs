//! Error types for the oxidized-xenon emulator

use thiserror::Error;

/// Main error type for the emulator
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("VFS error: {0}")]
    Vfs(#[from] VfsError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Emulator has not been set up")]
    NotInitialized,

    #[error("Subsystem setup failed: {0}")]
    SetupFailed(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("No title is active")]
    NoTitle,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Guest memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Invalid address: 0x{0:08x}")]
    InvalidAddress(u32),

    #[error("Access violation at 0x{addr:08x}: {kind}")]
    AccessViolation { addr: u32, kind: AccessKind },
}

/// Executable image loader errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Invalid XEX: {0}")]
    InvalidXex(String),

    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    #[error("Unsupported executable format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown module magic: {0:08X}")]
    UnknownMagic(u32),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Patch is not applicable: {0}")]
    PatchNotApplicable(String),

    #[error("Patch failed: {0}")]
    PatchFailed(String),

    #[error("Invalid load stage: {0}")]
    InvalidStage(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Kernel (object table, modules, content) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsuccessful: {0}")]
    Unsuccessful(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("VFS error: {0}")]
    Vfs(#[from] VfsError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// Virtual filesystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("No such file: {0}")]
    NotFound(String),

    #[error("Device initialization failed: {0}")]
    DeviceInit(String),

    #[error("Device already registered: {0}")]
    AlreadyRegistered(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for VfsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Machine snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing snapshot marker (found 0x{0:08x})")]
    BadMarker(u32),

    #[error("Snapshot title {found:?} does not match bound title {expected:?}")]
    TitleMismatch {
        expected: Option<u32>,
        found: Option<u32>,
    },

    #[error("Snapshot stream truncated at offset {offset} (wanted {wanted} bytes)")]
    Truncated { offset: usize, wanted: usize },

    #[error("Snapshot exceeds capacity of {0} bytes")]
    CapacityExceeded(u64),

    #[error("Invalid snapshot data: {0}")]
    Invalid(String),

    #[error("Could not {action} {subsystem}")]
    Subsystem {
        action: &'static str,
        subsystem: &'static str,
    },
}

/// Kind of memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MemoryError::AccessViolation {
            addr: 0xDEADBEEF,
            kind: AccessKind::Write,
        };
        assert_eq!(format!("{}", err), "Access violation at 0xdeadbeef: write");

        let err = LoaderError::UnknownMagic(0x1234_5678);
        assert_eq!(format!("{}", err), "Unknown module magic: 12345678");

        let err = SnapshotError::Subsystem {
            action: "restore",
            subsystem: "graphics system",
        };
        assert_eq!(format!("{}", err), "Could not restore graphics system");
    }

    #[test]
    fn test_error_conversion() {
        let loader_err = LoaderError::InvalidXex("bad header".into());
        let kernel_err: KernelError = loader_err.into();
        assert!(matches!(kernel_err, KernelError::Loader(_)));

        let emu_err: EmulatorError = kernel_err.into();
        assert!(matches!(emu_err, EmulatorError::Kernel(_)));
    }
}
