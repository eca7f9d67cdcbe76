//! XEX/ELF loader for oxidized-xenon

pub mod builder;
pub mod crypto;
pub mod elf;
pub mod patch;
pub mod xex;
pub mod xex_module;

pub use builder::XexBuilder;
pub use crypto::{NullCrypto, XexCrypto};
pub use elf::ElfModule;
pub use xex::{
    header_keys, ExecutionInfo, ModuleFlags, OptHeader, OptHeaderValue, Resource, XexVersion,
};
pub use xex_module::XexModule;

/// Outcome of a successful load call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The module is fully loaded
    Complete,
    /// Headers are parsed; linking is deferred to a second phase
    Pending,
}

/// Executable format detected from the leading magic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    Xex,
    Elf,
}

/// 'XEX2'
pub const XEX2_MAGIC: u32 = 0x5845_5832;
/// 'XEX1'
pub const XEX1_MAGIC: u32 = 0x5845_5831;
/// 0x7F 'ELF'
pub const ELF_MAGIC: u32 = 0x7F45_4C46;
/// 'MZ', a PE image (XNA titles)
pub const MZ_MAGIC: u16 = 0x4D5A;

/// Classify an image by its leading magic
pub fn detect_format(data: &[u8]) -> Result<ModuleFormat, ox_core::error::LoaderError> {
    use ox_core::error::LoaderError;

    if data.len() < 4 {
        if data.len() >= 2 && u16::from_be_bytes([data[0], data[1]]) == MZ_MAGIC {
            return Err(LoaderError::UnsupportedFormat(
                "XNA executables are not yet implemented".into(),
            ));
        }
        return Err(LoaderError::UnknownMagic(0));
    }

    let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    match magic {
        XEX2_MAGIC | XEX1_MAGIC => Ok(ModuleFormat::Xex),
        ELF_MAGIC => Ok(ModuleFormat::Elf),
        _ if (magic >> 16) as u16 == MZ_MAGIC => Err(LoaderError::UnsupportedFormat(
            "XNA executables are not yet implemented".into(),
        )),
        _ => Err(LoaderError::UnknownMagic(magic)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ox_core::error::LoaderError;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"XEX2\0\0\0\0").unwrap(), ModuleFormat::Xex);
        assert_eq!(detect_format(b"XEX1\0\0\0\0").unwrap(), ModuleFormat::Xex);
        assert_eq!(detect_format(b"\x7FELF\x01").unwrap(), ModuleFormat::Elf);
        assert!(matches!(
            detect_format(b"MZ\x90\0"),
            Err(LoaderError::UnsupportedFormat(_))
        ));
        assert_eq!(
            detect_format(b"ABCD"),
            Err(LoaderError::UnknownMagic(0x4142_4344))
        );
    }
}
