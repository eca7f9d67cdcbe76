//! XEX translation unit

use crate::crypto::XexCrypto;
use crate::xex::*;
use ox_core::error::LoaderError;
use ox_cpu::{ExportKind, ExportResolver};
use ox_memory::{MemoryManager, PageFlags};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// PowerPC `sc`
pub const PPC_SC: u32 = 0x4400_0002;
/// PowerPC `blr`
pub const PPC_BLR: u32 = 0x4E80_0020;
/// Written into variable imports nothing exports
pub const UNRESOLVED_VARIABLE: u32 = 0xD000_BEEF;

/// Stack size used when the image does not declare one
pub const DEFAULT_STACK_SIZE: u32 = 1024 * 1024;

/// Result of linking one import record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    pub library: String,
    pub ordinal: u16,
    /// Guest address of the record
    pub address: u32,
    pub record_type: ImportRecordType,
    pub resolved: bool,
}

/// A loaded XEX image.
///
/// [`XexModule::load`] parses the header block and decodes the image body
/// into host memory; nothing touches guest memory until
/// [`XexModule::load_continue`], so a patch can still rewrite headers and
/// image in between.
pub struct XexModule {
    name: String,
    path: String,
    header: Vec<u8>,
    xex_header: XexHeader,
    opt_headers: Vec<OptHeader>,
    security: SecurityInfo,
    format_info: Option<FileFormatInfo>,
    image: Vec<u8>,
    base_address: u32,
    loaded: bool,
    imports: Vec<ImportBinding>,
    crypto: Arc<dyn XexCrypto>,
}

impl XexModule {
    /// Parse the header block of `data` and, when `length` extends past the
    /// header block, decode the image body. A `length` of 0 loads headers
    /// only, which is enough to check a patch for applicability.
    pub fn load(
        name: &str,
        path: &str,
        data: &[u8],
        length: usize,
        crypto: Arc<dyn XexCrypto>,
    ) -> Result<Self, LoaderError> {
        let xex_header = XexHeader::parse(data)?;
        let header = data[..xex_header.header_size as usize].to_vec();
        let opt_headers = parse_opt_headers(&header, xex_header.header_count)?;
        let security = SecurityInfo::parse(&header, xex_header.security_offset as usize)?;

        let mut module = Self {
            name: name.to_string(),
            path: path.to_string(),
            header,
            xex_header,
            opt_headers,
            security,
            format_info: None,
            image: Vec::new(),
            base_address: 0,
            loaded: false,
            imports: Vec::new(),
            crypto,
        };
        module.refresh_cached_headers()?;

        let signed_start = module.xex_header.security_offset as usize + 0x108;
        if !module.crypto.verify_header(
            module.header.get(signed_start..).unwrap_or_default(),
            &module.security.rsa_signature,
        ) {
            warn!("{}: header signature does not verify", module.name);
        }

        let length = length.min(data.len());
        if length > module.xex_header.header_size as usize {
            module.image = module.decode_image(&data[module.xex_header.header_size as usize..length])?;
        }

        info!(
            "XEX {} loaded: flags={:?} base=0x{:08X} image_size=0x{:X}",
            module.name,
            module.xex_header.module_flags,
            module.base_address,
            module.security.image_size
        );
        Ok(module)
    }

    /// Rebuild a module from its (possibly patched) header block. The image
    /// is taken to be in guest memory already, as after a memory restore.
    pub fn restore_linked(
        name: &str,
        path: &str,
        header: &[u8],
        crypto: Arc<dyn XexCrypto>,
    ) -> Result<Self, LoaderError> {
        let mut module = Self::load(name, path, header, 0, crypto)?;
        // A rewritten block is authoritative for its own size
        module.replace_headers(header.to_vec())?;
        module.loaded = true;
        Ok(module)
    }

    /// Re-derive everything computed from the header block
    fn refresh_cached_headers(&mut self) -> Result<(), LoaderError> {
        self.format_info = match self.opt_header_data(header_keys::FILE_FORMAT_INFO) {
            Some(data) => Some(FileFormatInfo::parse(data)?),
            None => None,
        };
        self.base_address = self
            .opt_header_value(header_keys::IMAGE_BASE_ADDRESS)
            .unwrap_or(self.security.load_address);
        Ok(())
    }

    /// Swap in a new header block, as produced by a header delta
    pub(crate) fn replace_headers(&mut self, header: Vec<u8>) -> Result<(), LoaderError> {
        let mut xex_header = XexHeader::parse(&header)?;
        // The rewritten block is authoritative for its own size
        xex_header.header_size = header.len() as u32;
        self.opt_headers = parse_opt_headers(&header, xex_header.header_count)?;
        self.security = SecurityInfo::parse(&header, xex_header.security_offset as usize)?;
        self.xex_header = xex_header;
        self.header = header;
        self.refresh_cached_headers()
    }

    fn decode_image(&self, body: &[u8]) -> Result<Vec<u8>, LoaderError> {
        let format = self.format_info.clone().unwrap_or(FileFormatInfo {
            encryption: EncryptionType::None,
            compression: CompressionType::None,
        });

        let mut body = body.to_vec();
        if format.encryption == EncryptionType::Normal {
            self.crypto.decrypt_image(&self.security.aes_key, &mut body)?;
        }

        // Patch bodies carry delta records, not an image of image_size bytes
        let target_len = if self.is_patch() {
            None
        } else {
            Some(self.security.image_size as usize)
        };

        let mut image = match &format.compression {
            CompressionType::None => body,
            CompressionType::Basic(blocks) => {
                let limit = target_len.unwrap_or(body.len().max(self.security.image_size as usize));
                let total = blocks.iter().try_fold(0usize, |total, block| {
                    total
                        .checked_add(block.data_size as usize)?
                        .checked_add(block.zero_size as usize)
                });
                match total {
                    Some(total) if total <= limit => {}
                    _ => {
                        return Err(LoaderError::InvalidXex(format!(
                            "basic blocks expand past the 0x{:x} byte image",
                            limit
                        )))
                    }
                }

                let mut out = Vec::with_capacity(limit);
                let mut offset = 0usize;
                for block in blocks {
                    let data = bytes(&body, offset, block.data_size as usize).map_err(|_| {
                        LoaderError::InvalidXex(format!(
                            "basic block of 0x{:x} bytes at 0x{:x} overruns body",
                            block.data_size, offset
                        ))
                    })?;
                    out.extend_from_slice(data);
                    out.resize(out.len() + block.zero_size as usize, 0);
                    offset += block.data_size as usize;
                }
                out
            }
            CompressionType::Normal { window_size } => {
                let out_len = target_len.unwrap_or(self.security.image_size as usize);
                self.crypto.decompress_lzx(*window_size, &body, out_len)?
            }
        };

        if let Some(len) = target_len {
            image.resize(len, 0);
        }
        Ok(image)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw header block, as copied into guest memory
    pub fn header_bytes(&self) -> &[u8] {
        &self.header
    }

    pub fn xex_header(&self) -> &XexHeader {
        &self.xex_header
    }

    pub fn module_flags(&self) -> ModuleFlags {
        self.xex_header.module_flags
    }

    pub fn security_info(&self) -> &SecurityInfo {
        &self.security
    }

    pub fn opt_headers(&self) -> &[OptHeader] {
        &self.opt_headers
    }

    pub fn format_info(&self) -> Option<&FileFormatInfo> {
        self.format_info.as_ref()
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn image_size(&self) -> u32 {
        self.security.image_size
    }

    /// Decoded image body (delta records for a patch)
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut Vec<u8> {
        &mut self.image
    }

    pub(crate) fn crypto(&self) -> &Arc<dyn XexCrypto> {
        &self.crypto
    }

    pub fn is_patch(&self) -> bool {
        self.xex_header.module_flags.is_patch()
    }

    pub fn is_dll(&self) -> bool {
        self.xex_header.module_flags.contains(ModuleFlags::DLL)
    }

    /// Whether the image has been placed into guest memory
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn imports(&self) -> &[ImportBinding] {
        &self.imports
    }

    /// Look up an optional header, interpreting it for a header block at
    /// `header_base`. A base of 0 yields offsets into [`Self::header_bytes`].
    pub fn get_opt_header(&self, key: u32, header_base: u32) -> Option<OptHeaderValue> {
        self.opt_headers
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.key == key)
            .map(|(index, entry)| OptHeaderValue::interpret(entry, index, header_base))
    }

    /// The 32-bit value of an inline or pointer-subtype header
    pub fn opt_header_value(&self, key: u32) -> Option<u32> {
        match self.get_opt_header(key, 0)? {
            OptHeaderValue::Inline(value) => Some(value),
            OptHeaderValue::Pointer(offset) => be_u32(&self.header, offset as usize).ok(),
            OptHeaderValue::Offset(_) => None,
        }
    }

    /// Out-of-line data of an offset-subtype header.
    ///
    /// Subtype 0xFF payloads start with their own size; otherwise the
    /// subtype is the payload size in dwords.
    pub fn opt_header_data(&self, key: u32) -> Option<&[u8]> {
        let entry = self.opt_headers.iter().find(|entry| entry.key == key)?;
        let offset = match self.get_opt_header(key, 0)? {
            OptHeaderValue::Offset(offset) => offset as usize,
            _ => return None,
        };
        let len = match entry.subtype() {
            0xFF => be_u32(&self.header, offset).ok()? as usize,
            dwords => dwords as usize * 4,
        };
        self.header.get(offset..offset.checked_add(len)?)
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.opt_header_value(header_keys::ENTRY_POINT)
    }

    pub fn default_stack_size(&self) -> u32 {
        self.opt_header_value(header_keys::DEFAULT_STACK_SIZE)
            .filter(|&size| size != 0)
            .unwrap_or(DEFAULT_STACK_SIZE)
    }

    pub fn execution_info(&self) -> Option<ExecutionInfo> {
        self.opt_header_data(header_keys::EXECUTION_INFO)
            .and_then(|data| ExecutionInfo::parse(data).ok())
    }

    pub fn delta_descriptor(&self) -> Option<DeltaPatchDescriptor> {
        self.opt_header_data(header_keys::DELTA_PATCH_DESCRIPTOR)
            .and_then(|data| DeltaPatchDescriptor::parse(data).ok())
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.opt_header_data(header_keys::RESOURCE_INFO)
            .and_then(|data| parse_resources(data).ok())
            .unwrap_or_default()
    }

    pub fn import_libraries(&self) -> Result<Vec<ImportLibrary>, LoaderError> {
        match self.opt_header_data(header_keys::IMPORT_LIBRARIES) {
            Some(data) => parse_import_libraries(data),
            None => Ok(Vec::new()),
        }
    }

    /// Section layout as (guest address, size, kind)
    pub fn sections(&self) -> Vec<(u32, u32, SectionKind)> {
        let page_size = self.security.page_size();
        let mut address = self.base_address;
        self.security
            .page_descriptors
            .iter()
            .map(|desc| {
                let size = desc.page_count * page_size;
                let section = (address, size, desc.kind);
                address = address.wrapping_add(size);
                section
            })
            .collect()
    }

    /// Place the image into guest memory and link its imports
    pub fn load_continue(
        &mut self,
        memory: &MemoryManager,
        exports: &ExportResolver,
    ) -> Result<(), LoaderError> {
        if self.loaded {
            return Ok(());
        }
        if self.is_patch() {
            return Err(LoaderError::InvalidStage(format!(
                "{} is a patch and cannot be linked",
                self.name
            )));
        }
        if self.image.is_empty() && self.security.image_size != 0 {
            return Err(LoaderError::InvalidStage(format!(
                "{} was loaded without its image body",
                self.name
            )));
        }

        memory.commit(self.base_address, self.security.image_size, PageFlags::RWX)?;
        memory.write_bytes(self.base_address, &self.image)?;
        self.link_imports(memory, exports)?;
        self.loaded = true;

        debug!(
            "{} linked at 0x{:08X} with {} imports",
            self.name,
            self.base_address,
            self.imports.len()
        );
        Ok(())
    }

    fn link_imports(
        &mut self,
        memory: &MemoryManager,
        exports: &ExportResolver,
    ) -> Result<(), LoaderError> {
        let mut bindings = Vec::new();
        for library in self.import_libraries()? {
            for &record_address in &library.records {
                let value = memory.read_be32(record_address)?;
                let record_type = ImportRecordType::from_value(value);
                let ordinal = (value & 0xFFFF) as u16;
                let export = exports.get_export(&library.name, ordinal);

                let resolved = match record_type {
                    ImportRecordType::Variable => {
                        let target = match &export {
                            Some(e) if e.kind == ExportKind::Variable && e.variable_ptr != 0 => {
                                e.variable_ptr
                            }
                            _ => UNRESOLVED_VARIABLE,
                        };
                        memory.write_be32(record_address, target)?;
                        target != UNRESOLVED_VARIABLE
                    }
                    ImportRecordType::Thunk => {
                        memory.write_be32(record_address, PPC_SC)?;
                        memory.write_be32(record_address.wrapping_add(4), PPC_BLR)?;
                        export.is_some()
                    }
                    ImportRecordType::Other(kind) => {
                        warn!(
                            "{}: import record 0x{:08X} has unknown type {}",
                            self.name, record_address, kind
                        );
                        false
                    }
                };

                if !resolved {
                    debug!(
                        "Unresolved import {}@{} at 0x{:08X}",
                        library.name, ordinal, record_address
                    );
                }
                bindings.push(ImportBinding {
                    library: library.name.clone(),
                    ordinal,
                    address: record_address,
                    record_type,
                    resolved,
                });
            }
        }
        self.imports = bindings;
        Ok(())
    }

    /// Remove the image from guest memory
    pub fn unload(&mut self, memory: &MemoryManager) -> Result<(), LoaderError> {
        if !self.loaded {
            return Ok(());
        }
        memory.decommit(self.base_address, self.security.image_size)?;
        self.loaded = false;
        self.imports.clear();
        Ok(())
    }

    /// Log a description of the headers, security info and sections
    pub fn dump(&self) {
        info!("Module {} ({}):", self.name, self.path);
        info!("    Module Flags: {:?}", self.xex_header.module_flags);
        info!("    Header Size: 0x{:X}", self.xex_header.header_size);
        info!("Optional Headers:");
        for entry in &self.opt_headers {
            info!(
                "    {} (0x{:08X}) = 0x{:08X}",
                header_keys::name(entry.key),
                entry.key,
                entry.value
            );
        }
        if let Some(exec) = self.execution_info() {
            info!(
                "    Title ID: {:08X}, Media ID: {:08X}, Version: {}, Disc {}/{}",
                exec.title_id, exec.media_id, exec.version, exec.disc_number, exec.disc_count
            );
        }
        info!("Security Info:");
        info!("    Image Size: 0x{:X}", self.security.image_size);
        info!("    Image Flags: 0x{:08X}", self.security.image_flags);
        info!("    Load Address: 0x{:08X}", self.security.load_address);
        info!("    Export Table: 0x{:08X}", self.security.export_table);
        info!("Sections:");
        for (address, size, kind) in self.sections() {
            info!(
                "    0x{:08X}-0x{:08X} {} ({} bytes)",
                address,
                address.wrapping_add(size),
                kind.name(),
                size
            );
        }
        for resource in self.resources() {
            info!(
                "Resource {}: 0x{:08X} ({} bytes)",
                resource.name, resource.address, resource.size
            );
        }
        if let Ok(libraries) = self.import_libraries() {
            for library in libraries {
                info!(
                    "Imports {} v{} ({} records)",
                    library.name,
                    library.version,
                    library.records.len()
                );
            }
        }
    }
}

impl std::fmt::Debug for XexModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XexModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("flags", &self.xex_header.module_flags)
            .field("base_address", &self.base_address)
            .field("loaded", &self.loaded)
            .finish()
    }
}
