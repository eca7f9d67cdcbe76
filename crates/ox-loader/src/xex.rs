//! XEX container format
//!
//! All multi-byte fields are big-endian. The header block starts with a
//! fixed preamble followed by `header_count` optional header entries; the
//! security info block and any out-of-line optional header data live
//! inside the header block, before the image body at `header_size`.

use bitflags::bitflags;
use ox_core::error::LoaderError;
use std::fmt;

/// Offset of the first optional header entry
pub const OPT_HEADER_TABLE_OFFSET: usize = 0x18;
/// Size of one optional header entry
pub const OPT_HEADER_ENTRY_SIZE: usize = 8;
/// Size of the fixed part of the security info block
pub const SECURITY_INFO_SIZE: usize = 0x184;
/// Size of one page descriptor
pub const PAGE_DESCRIPTOR_SIZE: usize = 24;
/// Image flag selecting 4 KiB pages (64 KiB otherwise)
pub const IMAGE_FLAG_SMALL_PAGES: u32 = 0x1000_0000;
/// Delta records inside a patch descriptor start here
pub const DELTA_RECORDS_OFFSET: usize = 0x40;
/// Fixed part of a delta record
pub const DELTA_RECORD_HEADER_SIZE: usize = 12;

/// Optional header keys
pub mod header_keys {
    pub const RESOURCE_INFO: u32 = 0x0000_02FF;
    pub const FILE_FORMAT_INFO: u32 = 0x0000_03FF;
    pub const DELTA_PATCH_DESCRIPTOR: u32 = 0x0000_05FF;
    pub const BOUNDING_PATH: u32 = 0x0000_80FF;
    pub const ORIGINAL_BASE_ADDRESS: u32 = 0x0001_0001;
    pub const ENTRY_POINT: u32 = 0x0001_0100;
    pub const IMAGE_BASE_ADDRESS: u32 = 0x0001_0201;
    pub const IMPORT_LIBRARIES: u32 = 0x0001_03FF;
    pub const CHECKSUM_TIMESTAMP: u32 = 0x0001_8002;
    pub const ORIGINAL_PE_NAME: u32 = 0x0001_83FF;
    pub const STATIC_LIBRARIES: u32 = 0x0002_00FF;
    pub const TLS_INFO: u32 = 0x0002_0104;
    pub const DEFAULT_STACK_SIZE: u32 = 0x0002_0200;
    pub const DEFAULT_FILESYSTEM_CACHE_SIZE: u32 = 0x0002_0301;
    pub const DEFAULT_HEAP_SIZE: u32 = 0x0002_0401;
    pub const SYSTEM_FLAGS: u32 = 0x0003_0000;
    pub const EXECUTION_INFO: u32 = 0x0004_0006;
    pub const TITLE_WORKSPACE_SIZE: u32 = 0x0004_0201;
    pub const GAME_RATINGS: u32 = 0x0004_0310;
    pub const LAN_KEY: u32 = 0x0004_0404;
    pub const ADDITIONAL_TITLE_MEMORY: u32 = 0x0004_0801;
    pub const EXPORTS_BY_NAME: u32 = 0x00E1_0402;

    /// Display name of a known key
    pub fn name(key: u32) -> &'static str {
        match key {
            RESOURCE_INFO => "RESOURCE_INFO",
            FILE_FORMAT_INFO => "FILE_FORMAT_INFO",
            DELTA_PATCH_DESCRIPTOR => "DELTA_PATCH_DESCRIPTOR",
            BOUNDING_PATH => "BOUNDING_PATH",
            ORIGINAL_BASE_ADDRESS => "ORIGINAL_BASE_ADDRESS",
            ENTRY_POINT => "ENTRY_POINT",
            IMAGE_BASE_ADDRESS => "IMAGE_BASE_ADDRESS",
            IMPORT_LIBRARIES => "IMPORT_LIBRARIES",
            CHECKSUM_TIMESTAMP => "CHECKSUM_TIMESTAMP",
            ORIGINAL_PE_NAME => "ORIGINAL_PE_NAME",
            STATIC_LIBRARIES => "STATIC_LIBRARIES",
            TLS_INFO => "TLS_INFO",
            DEFAULT_STACK_SIZE => "DEFAULT_STACK_SIZE",
            DEFAULT_FILESYSTEM_CACHE_SIZE => "DEFAULT_FILESYSTEM_CACHE_SIZE",
            DEFAULT_HEAP_SIZE => "DEFAULT_HEAP_SIZE",
            SYSTEM_FLAGS => "SYSTEM_FLAGS",
            EXECUTION_INFO => "EXECUTION_INFO",
            TITLE_WORKSPACE_SIZE => "TITLE_WORKSPACE_SIZE",
            GAME_RATINGS => "GAME_RATINGS",
            LAN_KEY => "LAN_KEY",
            ADDITIONAL_TITLE_MEMORY => "ADDITIONAL_TITLE_MEMORY",
            EXPORTS_BY_NAME => "EXPORTS_BY_NAME",
            _ => "UNKNOWN",
        }
    }
}

bitflags! {
    /// Module flags from the XEX preamble
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModuleFlags: u32 {
        const TITLE            = 0x0000_0001;
        const EXPORTS_TO_TITLE = 0x0000_0002;
        const SYSTEM_DEBUGGER  = 0x0000_0004;
        const DLL              = 0x0000_0008;
        const MODULE_PATCH     = 0x0000_0010;
        const PATCH_FULL       = 0x0000_0020;
        const PATCH_DELTA      = 0x0000_0040;
        const USER_MODE        = 0x0000_0080;
    }
}

impl ModuleFlags {
    pub fn is_patch(&self) -> bool {
        self.intersects(Self::MODULE_PATCH | Self::PATCH_FULL | Self::PATCH_DELTA)
    }
}

pub(crate) fn be_u16(data: &[u8], offset: usize) -> Result<u16, LoaderError> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated(offset, 2, data.len()))
}

pub(crate) fn be_u32(data: &[u8], offset: usize) -> Result<u32, LoaderError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated(offset, 4, data.len()))
}

pub(crate) fn bytes(data: &[u8], offset: usize, len: usize) -> Result<&[u8], LoaderError> {
    data.get(offset..offset.saturating_add(len))
        .ok_or_else(|| truncated(offset, len, data.len()))
}

fn truncated(offset: usize, len: usize, available: usize) -> LoaderError {
    LoaderError::InvalidXex(format!(
        "read of {} bytes at 0x{:x} past end of {} byte header",
        len, offset, available
    ))
}

/// Fixed XEX preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XexHeader {
    pub magic: u32,
    pub module_flags: ModuleFlags,
    /// Size of the header block; the image body starts here
    pub header_size: u32,
    pub security_offset: u32,
    pub header_count: u32,
}

impl XexHeader {
    pub fn parse(data: &[u8]) -> Result<Self, LoaderError> {
        let header = Self {
            magic: be_u32(data, 0x00)?,
            module_flags: ModuleFlags::from_bits_retain(be_u32(data, 0x04)?),
            header_size: be_u32(data, 0x08)?,
            security_offset: be_u32(data, 0x10)?,
            header_count: be_u32(data, 0x14)?,
        };

        if (header.header_size as usize) > data.len() {
            return Err(LoaderError::InvalidXex(format!(
                "header size 0x{:x} exceeds image length 0x{:x}",
                header.header_size,
                data.len()
            )));
        }
        let table_end =
            OPT_HEADER_TABLE_OFFSET + header.header_count as usize * OPT_HEADER_ENTRY_SIZE;
        if table_end > header.header_size as usize {
            return Err(LoaderError::InvalidXex(format!(
                "{} optional headers do not fit in 0x{:x} header bytes",
                header.header_count, header.header_size
            )));
        }
        Ok(header)
    }
}

/// One raw optional header entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptHeader {
    pub key: u32,
    /// Inline value, or byte offset from the start of the header block
    pub value: u32,
}

impl OptHeader {
    /// Low byte of the key, selecting how `value` is interpreted
    pub fn subtype(&self) -> u8 {
        (self.key & 0xFF) as u8
    }
}

/// Interpreted optional header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptHeaderValue {
    /// Subtype 0x00: the stored value itself
    Inline(u32),
    /// Subtype 0x01: address of the stored value slot
    Pointer(u32),
    /// Any other subtype: header base plus the stored offset
    Offset(u32),
}

impl OptHeaderValue {
    /// Interpret entry `index` for a header block located at `header_base`
    pub fn interpret(entry: &OptHeader, index: usize, header_base: u32) -> Self {
        match entry.subtype() {
            0x00 => Self::Inline(entry.value),
            0x01 => Self::Pointer(
                header_base
                    .wrapping_add((OPT_HEADER_TABLE_OFFSET + index * OPT_HEADER_ENTRY_SIZE + 4) as u32),
            ),
            _ => Self::Offset(header_base.wrapping_add(entry.value)),
        }
    }

    /// The value, or the address it resolves to
    pub fn get(&self) -> u32 {
        match *self {
            Self::Inline(v) | Self::Pointer(v) | Self::Offset(v) => v,
        }
    }
}

pub fn parse_opt_headers(data: &[u8], count: u32) -> Result<Vec<OptHeader>, LoaderError> {
    (0..count as usize)
        .map(|i| {
            let offset = OPT_HEADER_TABLE_OFFSET + i * OPT_HEADER_ENTRY_SIZE;
            Ok(OptHeader {
                key: be_u32(data, offset)?,
                value: be_u32(data, offset + 4)?,
            })
        })
        .collect()
}

/// Kind of a section described by a page descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
    ReadOnly,
    Other(u8),
}

impl SectionKind {
    fn from_info(info: u8) -> Self {
        match info {
            1 => Self::Code,
            2 => Self::Data,
            3 => Self::ReadOnly,
            other => Self::Other(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Data => "data",
            Self::ReadOnly => "rodata",
            Self::Other(_) => "other",
        }
    }
}

/// A run of pages sharing one section kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescriptor {
    pub page_count: u32,
    pub kind: SectionKind,
    pub digest: [u8; 0x14],
}

/// Security info block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    pub header_size: u32,
    pub image_size: u32,
    pub rsa_signature: Vec<u8>,
    pub image_flags: u32,
    pub load_address: u32,
    pub aes_key: [u8; 16],
    pub export_table: u32,
    pub page_descriptors: Vec<PageDescriptor>,
}

impl SecurityInfo {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, LoaderError> {
        let mut aes_key = [0u8; 16];
        aes_key.copy_from_slice(bytes(data, offset + 0x150, 16)?);

        let count = be_u32(data, offset + 0x180)? as usize;
        let descriptors_start = offset + SECURITY_INFO_SIZE;
        if descriptors_start + count * PAGE_DESCRIPTOR_SIZE > data.len() {
            return Err(LoaderError::InvalidXex(format!(
                "{} page descriptors run past the header block",
                count
            )));
        }

        let page_descriptors = (0..count)
            .map(|i| {
                let at = descriptors_start + i * PAGE_DESCRIPTOR_SIZE;
                let value = be_u32(data, at)?;
                let mut digest = [0u8; 0x14];
                digest.copy_from_slice(bytes(data, at + 4, 0x14)?);
                Ok(PageDescriptor {
                    page_count: value >> 4,
                    kind: SectionKind::from_info((value & 0xF) as u8),
                    digest,
                })
            })
            .collect::<Result<Vec<_>, LoaderError>>()?;

        Ok(Self {
            header_size: be_u32(data, offset)?,
            image_size: be_u32(data, offset + 0x4)?,
            rsa_signature: bytes(data, offset + 0x8, 0x100)?.to_vec(),
            image_flags: be_u32(data, offset + 0x10C)?,
            load_address: be_u32(data, offset + 0x110)?,
            aes_key,
            export_table: be_u32(data, offset + 0x160)?,
            page_descriptors,
        })
    }

    pub fn page_size(&self) -> u32 {
        if self.image_flags & IMAGE_FLAG_SMALL_PAGES != 0 {
            0x1000
        } else {
            0x10000
        }
    }
}

/// Packed module version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XexVersion(pub u32);

impl XexVersion {
    pub fn major(&self) -> u32 {
        self.0 >> 28
    }

    pub fn minor(&self) -> u32 {
        (self.0 >> 24) & 0xF
    }

    pub fn build(&self) -> u32 {
        (self.0 >> 8) & 0xFFFF
    }

    pub fn qfe(&self) -> u32 {
        self.0 & 0xFF
    }
}

impl fmt::Display for XexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qfe() != 0 {
            write!(f, "{}.{}.{}.{}", self.major(), self.minor(), self.build(), self.qfe())
        } else if self.build() != 0 {
            write!(f, "{}.{}.{}", self.major(), self.minor(), self.build())
        } else {
            write!(f, "{}.{}", self.major(), self.minor())
        }
    }
}

/// EXECUTION_INFO payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionInfo {
    pub media_id: u32,
    pub version: XexVersion,
    pub base_version: XexVersion,
    pub title_id: u32,
    pub platform: u8,
    pub executable_table: u8,
    pub disc_number: u8,
    pub disc_count: u8,
    pub savegame_id: u32,
}

impl ExecutionInfo {
    pub const SIZE: usize = 0x18;

    pub fn parse(data: &[u8]) -> Result<Self, LoaderError> {
        let small = bytes(data, 0x10, 4)?;
        Ok(Self {
            media_id: be_u32(data, 0x0)?,
            version: XexVersion(be_u32(data, 0x4)?),
            base_version: XexVersion(be_u32(data, 0x8)?),
            title_id: be_u32(data, 0xC)?,
            platform: small[0],
            executable_table: small[1],
            disc_number: small[2],
            disc_count: small[3],
            savegame_id: be_u32(data, 0x14)?,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0x0..0x4].copy_from_slice(&self.media_id.to_be_bytes());
        out[0x4..0x8].copy_from_slice(&self.version.0.to_be_bytes());
        out[0x8..0xC].copy_from_slice(&self.base_version.0.to_be_bytes());
        out[0xC..0x10].copy_from_slice(&self.title_id.to_be_bytes());
        out[0x10] = self.platform;
        out[0x11] = self.executable_table;
        out[0x12] = self.disc_number;
        out[0x13] = self.disc_count;
        out[0x14..0x18].copy_from_slice(&self.savegame_id.to_be_bytes());
        out
    }
}

/// Body encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    None,
    Normal,
}

/// One basic-compression block: raw bytes followed by a zero run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    pub data_size: u32,
    pub zero_size: u32,
}

/// Body compression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Basic(Vec<BasicBlock>),
    Normal { window_size: u32 },
}

/// FILE_FORMAT_INFO payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFormatInfo {
    pub encryption: EncryptionType,
    pub compression: CompressionType,
}

impl FileFormatInfo {
    pub fn parse(data: &[u8]) -> Result<Self, LoaderError> {
        let info_size = be_u32(data, 0)? as usize;
        let encryption = match be_u16(data, 4)? {
            0 => EncryptionType::None,
            1 => EncryptionType::Normal,
            other => {
                return Err(LoaderError::InvalidXex(format!(
                    "unknown encryption type {}",
                    other
                )))
            }
        };
        let compression = match be_u16(data, 6)? {
            0 => CompressionType::None,
            1 => {
                let count = info_size.saturating_sub(8) / 8;
                let blocks = (0..count)
                    .map(|i| {
                        Ok(BasicBlock {
                            data_size: be_u32(data, 8 + i * 8)?,
                            zero_size: be_u32(data, 12 + i * 8)?,
                        })
                    })
                    .collect::<Result<Vec<_>, LoaderError>>()?;
                CompressionType::Basic(blocks)
            }
            2 => CompressionType::Normal {
                window_size: be_u32(data, 8)?,
            },
            other => {
                return Err(LoaderError::InvalidXex(format!(
                    "unsupported compression type {}",
                    other
                )))
            }
        };
        Ok(Self {
            encryption,
            compression,
        })
    }
}

/// Named resource inside the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

/// RESOURCE_INFO payload: a size followed by 16-byte entries
pub fn parse_resources(data: &[u8]) -> Result<Vec<Resource>, LoaderError> {
    let size = be_u32(data, 0)? as usize;
    let count = size.saturating_sub(4) / 16;
    (0..count)
        .map(|i| {
            let at = 4 + i * 16;
            let raw_name = bytes(data, at, 8)?;
            let end = raw_name.iter().position(|&b| b == 0).unwrap_or(8);
            Ok(Resource {
                name: String::from_utf8_lossy(&raw_name[..end]).into_owned(),
                address: be_u32(data, at + 8)?,
                size: be_u32(data, at + 12)?,
            })
        })
        .collect()
}

/// A delta record, used both for header and image patching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaRecord {
    pub old_address: u32,
    pub new_address: u32,
    pub uncompressed_len: u16,
    /// 0 zero-fills, 1 copies from old, anything else is an LZX delta
    pub compressed_len: u16,
    pub data: Vec<u8>,
}

/// Parse a run of delta records, stopping at an all-zero terminator
pub fn parse_delta_records(data: &[u8]) -> Result<Vec<DeltaRecord>, LoaderError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset + DELTA_RECORD_HEADER_SIZE <= data.len() {
        let old_address = be_u32(data, offset)?;
        let new_address = be_u32(data, offset + 4)?;
        let uncompressed_len = be_u16(data, offset + 8)?;
        let compressed_len = be_u16(data, offset + 10)?;
        if old_address == 0 && new_address == 0 && uncompressed_len == 0 && compressed_len == 0 {
            break;
        }

        let payload_len = if compressed_len > 1 {
            compressed_len as usize
        } else {
            0
        };
        let payload = bytes(data, offset + DELTA_RECORD_HEADER_SIZE, payload_len)?.to_vec();
        records.push(DeltaRecord {
            old_address,
            new_address,
            uncompressed_len,
            compressed_len,
            data: payload,
        });
        offset += DELTA_RECORD_HEADER_SIZE + payload_len;
    }
    Ok(records)
}

/// DELTA_PATCH_DESCRIPTOR payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPatchDescriptor {
    pub size: u32,
    pub target_version: XexVersion,
    pub source_version: XexVersion,
    pub digest_source: [u8; 0x14],
    pub image_key_source: [u8; 0x10],
    pub size_of_target_headers: u32,
    pub delta_headers_source_offset: u32,
    pub delta_headers_source_size: u32,
    pub delta_headers_target_offset: u32,
    pub header_records: Vec<DeltaRecord>,
}

impl DeltaPatchDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, LoaderError> {
        let size = be_u32(data, 0)?;
        let mut digest_source = [0u8; 0x14];
        digest_source.copy_from_slice(bytes(data, 0xC, 0x14)?);
        let mut image_key_source = [0u8; 0x10];
        image_key_source.copy_from_slice(bytes(data, 0x20, 0x10)?);

        let end = (size as usize).min(data.len());
        let header_records = if end > DELTA_RECORDS_OFFSET {
            parse_delta_records(&data[DELTA_RECORDS_OFFSET..end])?
        } else {
            Vec::new()
        };

        Ok(Self {
            size,
            target_version: XexVersion(be_u32(data, 0x4)?),
            source_version: XexVersion(be_u32(data, 0x8)?),
            digest_source,
            image_key_source,
            size_of_target_headers: be_u32(data, 0x30)?,
            delta_headers_source_offset: be_u32(data, 0x34)?,
            delta_headers_source_size: be_u32(data, 0x38)?,
            delta_headers_target_offset: be_u32(data, 0x3C)?,
            header_records,
        })
    }
}

/// Import record type stored in the top byte of a record value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportRecordType {
    Variable,
    Thunk,
    Other(u8),
}

impl ImportRecordType {
    pub fn from_value(value: u32) -> Self {
        match (value >> 24) as u8 {
            0 => Self::Variable,
            1 => Self::Thunk,
            other => Self::Other(other),
        }
    }
}

/// One imported library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportLibrary {
    pub name: String,
    pub id: u32,
    pub version: XexVersion,
    pub version_min: XexVersion,
    /// Guest addresses of the import records
    pub records: Vec<u32>,
}

/// IMPORT_LIBRARIES payload
pub fn parse_import_libraries(data: &[u8]) -> Result<Vec<ImportLibrary>, LoaderError> {
    let size = be_u32(data, 0)? as usize;
    let table_size = be_u32(data, 4)? as usize;
    let count = be_u32(data, 8)? as usize;
    let string_data = bytes(data, 12, table_size)?;

    let names: Vec<String> = string_data
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    let mut libraries = Vec::with_capacity(count);
    let mut offset = 12 + table_size;
    for _ in 0..count {
        if offset >= size.min(data.len()) {
            break;
        }
        let lib_size = be_u32(data, offset)? as usize;
        let name_index = be_u16(data, offset + 0x24)? as usize;
        let record_count = be_u16(data, offset + 0x26)? as usize;
        let records = (0..record_count)
            .map(|i| be_u32(data, offset + 0x28 + i * 4))
            .collect::<Result<Vec<_>, LoaderError>>()?;

        libraries.push(ImportLibrary {
            name: names.get(name_index).cloned().ok_or_else(|| {
                LoaderError::InvalidXex(format!("import name index {} out of range", name_index))
            })?,
            id: be_u32(data, offset + 0x18)?,
            version: XexVersion(be_u32(data, offset + 0x1C)?),
            version_min: XexVersion(be_u32(data, offset + 0x20)?),
            records,
        });

        if lib_size == 0 {
            break;
        }
        offset += lib_size;
    }
    Ok(libraries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert_eq!(XexVersion(0x2000_0000).to_string(), "2.0");
        assert_eq!(XexVersion(0x2100_1100).to_string(), "2.1.17");
        assert_eq!(XexVersion(0x2100_1103).to_string(), "2.1.17.3");
        let v = XexVersion(0x2100_1103);
        assert_eq!((v.major(), v.minor(), v.build(), v.qfe()), (2, 1, 0x11, 3));
    }

    #[test]
    fn test_opt_header_interpretation() {
        let inline = OptHeader {
            key: header_keys::ENTRY_POINT,
            value: 0x8200_1000,
        };
        let pointer = OptHeader {
            key: header_keys::IMAGE_BASE_ADDRESS,
            value: 0x8200_0000,
        };
        let offset = OptHeader {
            key: header_keys::EXECUTION_INFO,
            value: 0x120,
        };

        let base = 0x8000_0000;
        assert_eq!(
            OptHeaderValue::interpret(&inline, 0, base),
            OptHeaderValue::Inline(0x8200_1000)
        );
        assert_eq!(
            OptHeaderValue::interpret(&pointer, 2, base),
            OptHeaderValue::Pointer(base + 0x18 + 2 * 8 + 4)
        );
        assert_eq!(
            OptHeaderValue::interpret(&offset, 5, base),
            OptHeaderValue::Offset(base + 0x120)
        );
    }

    #[test]
    fn test_delta_record_parsing() {
        let mut data = Vec::new();
        // zero fill
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0x10, 0, 0, 0x20, 0, 0]);
        // lzx with 3 payload bytes
        data.extend_from_slice(&[0, 0, 0, 4, 0, 0, 0, 8, 0, 8, 0, 3, 0xAA, 0xBB, 0xCC]);
        // terminator
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(&[0xFF; 4]);

        let records = parse_delta_records(&data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].compressed_len, 0);
        assert_eq!(records[0].new_address, 0x1000);
        assert_eq!(records[1].data, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_resources_bounded_by_declared_size() {
        let mut data = Vec::new();
        data.extend_from_slice(&(4u32 + 16).to_be_bytes());
        data.extend_from_slice(b"XUI\0\0\0\0\0");
        data.extend_from_slice(&0x8210_0000u32.to_be_bytes());
        data.extend_from_slice(&0x200u32.to_be_bytes());
        // Trailing garbage that looks like another entry
        data.extend_from_slice(b"EXTRA\0\0\0");
        data.extend_from_slice(&[0xFF; 8]);

        let resources = parse_resources(&data).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "XUI");
        assert_eq!(resources[0].size, 0x200);
    }
}
