//! Synthetic XEX images
//!
//! Produces well-formed, unencrypted XEX2 files for tooling and tests.

use crate::xex::*;

enum Payload {
    /// Stored in the entry's value slot
    Value(u32),
    /// Stored out of line; the entry holds its offset
    Data(Vec<u8>),
}

struct Import {
    name: String,
    version: u32,
    records: Vec<u32>,
}

/// Builder for XEX2 images
pub struct XexBuilder {
    module_flags: ModuleFlags,
    load_address: u32,
    image: Vec<u8>,
    basic_compression: bool,
    headers: Vec<(u32, Payload)>,
    resources: Vec<(String, u32, u32)>,
    imports: Vec<Import>,
}

impl Default for XexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl XexBuilder {
    pub fn new() -> Self {
        Self {
            module_flags: ModuleFlags::TITLE,
            load_address: 0x8200_0000,
            image: vec![0; 0x1000],
            basic_compression: false,
            headers: Vec::new(),
            resources: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn module_flags(mut self, flags: ModuleFlags) -> Self {
        self.module_flags = flags;
        self
    }

    /// Security info load address
    pub fn load_address(mut self, address: u32) -> Self {
        self.load_address = address;
        self
    }

    /// Image body contents, padded to whole pages
    pub fn image(mut self, image: Vec<u8>) -> Self {
        self.image = image;
        self
    }

    /// Store the body with basic (zero-run) compression
    pub fn basic_compression(mut self, enable: bool) -> Self {
        self.basic_compression = enable;
        self
    }

    /// Add an optional header whose 32-bit value lives in the entry itself
    /// (subtypes 0x00 and 0x01)
    pub fn opt_header_value(mut self, key: u32, value: u32) -> Self {
        self.headers.push((key, Payload::Value(value)));
        self
    }

    /// Add an optional header with out-of-line data
    pub fn opt_header_data(mut self, key: u32, data: Vec<u8>) -> Self {
        self.headers.push((key, Payload::Data(data)));
        self
    }

    pub fn entry_point(self, address: u32) -> Self {
        self.opt_header_value(header_keys::ENTRY_POINT, address)
    }

    pub fn stack_size(self, size: u32) -> Self {
        self.opt_header_value(header_keys::DEFAULT_STACK_SIZE, size)
    }

    pub fn image_base(self, address: u32) -> Self {
        self.opt_header_value(header_keys::IMAGE_BASE_ADDRESS, address)
    }

    pub fn execution_info(self, info: ExecutionInfo) -> Self {
        self.opt_header_data(header_keys::EXECUTION_INFO, info.to_bytes().to_vec())
    }

    pub fn resource(mut self, name: &str, address: u32, size: u32) -> Self {
        self.resources.push((name.to_string(), address, size));
        self
    }

    /// Import `records` (guest addresses inside the image) from `library`
    pub fn import_library(mut self, name: &str, version: u32, records: Vec<u32>) -> Self {
        self.imports.push(Import {
            name: name.to_string(),
            version,
            records,
        });
        self
    }

    /// Describe this image as a delta patch from `source_version`.
    ///
    /// Image delta records go in the body; see [`Self::delta_records`].
    pub fn delta_patch(self, source_version: u32, target_version: u32) -> Self {
        self.delta_patch_with_headers(source_version, target_version, None, &[])
    }

    /// Delta patch that also rewrites the base's header block: the target
    /// headers are `size` bytes, seeded from `source_range` (offset, len,
    /// target offset) of the base headers, then `records` are applied.
    pub fn delta_patch_with_headers(
        self,
        source_version: u32,
        target_version: u32,
        header_delta: Option<(u32, u32, u32, u32)>,
        records: &[DeltaRecord],
    ) -> Self {
        let (size, src_off, src_size, dst_off) = header_delta.unwrap_or((0, 0, 0, 0));
        let encoded = encode_delta_records(records);

        let mut data = Vec::new();
        data.extend_from_slice(&((DELTA_RECORDS_OFFSET + encoded.len()) as u32).to_be_bytes());
        data.extend_from_slice(&target_version.to_be_bytes());
        data.extend_from_slice(&source_version.to_be_bytes());
        data.extend_from_slice(&[0u8; 0x14]);
        data.extend_from_slice(&[0u8; 0x10]);
        data.extend_from_slice(&size.to_be_bytes());
        data.extend_from_slice(&src_off.to_be_bytes());
        data.extend_from_slice(&src_size.to_be_bytes());
        data.extend_from_slice(&dst_off.to_be_bytes());
        data.extend_from_slice(&encoded);

        let flags = self.module_flags | ModuleFlags::MODULE_PATCH | ModuleFlags::PATCH_DELTA;
        self.module_flags(flags)
            .opt_header_data(header_keys::DELTA_PATCH_DESCRIPTOR, data)
    }

    /// Use encoded delta records as the body of a patch image
    pub fn delta_records(self, records: &[DeltaRecord]) -> Self {
        self.image(encode_delta_records(records))
    }

    fn resource_payload(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(4 + 16 * self.resources.len() as u32).to_be_bytes());
        for (name, address, size) in &self.resources {
            let mut raw = [0u8; 8];
            let len = name.len().min(8);
            raw[..len].copy_from_slice(&name.as_bytes()[..len]);
            data.extend_from_slice(&raw);
            data.extend_from_slice(&address.to_be_bytes());
            data.extend_from_slice(&size.to_be_bytes());
        }
        data
    }

    fn import_payload(&self) -> Vec<u8> {
        let mut strings = Vec::new();
        for import in &self.imports {
            strings.extend_from_slice(import.name.as_bytes());
            strings.push(0);
            while strings.len() % 4 != 0 {
                strings.push(0);
            }
        }

        let mut libraries = Vec::new();
        for (index, import) in self.imports.iter().enumerate() {
            let size = 0x28 + 4 * import.records.len() as u32;
            libraries.extend_from_slice(&size.to_be_bytes());
            libraries.extend_from_slice(&[0u8; 0x14]);
            libraries.extend_from_slice(&(index as u32).to_be_bytes());
            libraries.extend_from_slice(&import.version.to_be_bytes());
            libraries.extend_from_slice(&import.version.to_be_bytes());
            libraries.extend_from_slice(&(index as u16).to_be_bytes());
            libraries.extend_from_slice(&(import.records.len() as u16).to_be_bytes());
            for record in &import.records {
                libraries.extend_from_slice(&record.to_be_bytes());
            }
        }

        let mut data = Vec::new();
        data.extend_from_slice(&((12 + strings.len() + libraries.len()) as u32).to_be_bytes());
        data.extend_from_slice(&(strings.len() as u32).to_be_bytes());
        data.extend_from_slice(&(self.imports.len() as u32).to_be_bytes());
        data.extend_from_slice(&strings);
        data.extend_from_slice(&libraries);
        data
    }

    /// Encode the body and the matching FILE_FORMAT_INFO payload
    fn encode_body(&self, image: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut info = Vec::new();
        if !self.basic_compression {
            info.extend_from_slice(&8u32.to_be_bytes());
            info.extend_from_slice(&0u16.to_be_bytes());
            info.extend_from_slice(&0u16.to_be_bytes());
            return (info, image.to_vec());
        }

        // One block per run of data followed by its trailing zeros
        let mut blocks = Vec::new();
        let mut body = Vec::new();
        let mut i = 0;
        while i < image.len() {
            let start = i;
            while i < image.len() && image[i] != 0 {
                i += 1;
            }
            let data_end = i;
            while i < image.len() && image[i] == 0 {
                i += 1;
            }
            body.extend_from_slice(&image[start..data_end]);
            blocks.push(((data_end - start) as u32, (i - data_end) as u32));
        }

        info.extend_from_slice(&(8 + 8 * blocks.len() as u32).to_be_bytes());
        info.extend_from_slice(&0u16.to_be_bytes());
        info.extend_from_slice(&1u16.to_be_bytes());
        for (data_size, zero_size) in blocks {
            info.extend_from_slice(&data_size.to_be_bytes());
            info.extend_from_slice(&zero_size.to_be_bytes());
        }
        (info, body)
    }

    pub fn build(self) -> Vec<u8> {
        let is_patch = self.module_flags.is_patch();
        let mut image = self.image.clone();
        if !is_patch {
            let padded = (image.len() + 0xFFF) & !0xFFF;
            image.resize(padded.max(0x1000), 0);
        }
        let image_size = if is_patch {
            (image.len() as u32 + 0xFFF) & !0xFFF
        } else {
            image.len() as u32
        };

        let (format_info, body) = self.encode_body(&image);

        let mut entries: Vec<(u32, Payload)> = Vec::new();
        entries.push((header_keys::FILE_FORMAT_INFO, Payload::Data(format_info)));
        if !self.resources.is_empty() {
            entries.push((header_keys::RESOURCE_INFO, Payload::Data(self.resource_payload())));
        }
        if !self.imports.is_empty() {
            entries.push((header_keys::IMPORT_LIBRARIES, Payload::Data(self.import_payload())));
        }
        entries.extend(self.headers);

        // Layout: preamble, entry table, out-of-line data, security info
        let table_end = OPT_HEADER_TABLE_OFFSET + entries.len() * OPT_HEADER_ENTRY_SIZE;
        let mut header = vec![0u8; table_end];
        header[0..4].copy_from_slice(&crate::XEX2_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&self.module_flags.bits().to_be_bytes());
        header[0x14..0x18].copy_from_slice(&(entries.len() as u32).to_be_bytes());

        for (index, (key, payload)) in entries.iter().enumerate() {
            let slot = OPT_HEADER_TABLE_OFFSET + index * OPT_HEADER_ENTRY_SIZE;
            let value = match payload {
                Payload::Value(value) => *value,
                Payload::Data(data) => {
                    while header.len() % 8 != 0 {
                        header.push(0);
                    }
                    let offset = header.len() as u32;
                    header.extend_from_slice(data);
                    offset
                }
            };
            header[slot..slot + 4].copy_from_slice(&key.to_be_bytes());
            header[slot + 4..slot + 8].copy_from_slice(&value.to_be_bytes());
        }

        while header.len() % 8 != 0 {
            header.push(0);
        }
        let security_offset = header.len();
        let page_count = image_size / 0x1000;
        let mut security = vec![0u8; SECURITY_INFO_SIZE + PAGE_DESCRIPTOR_SIZE];
        security[0x4..0x8].copy_from_slice(&image_size.to_be_bytes());
        security[0x10C..0x110].copy_from_slice(&IMAGE_FLAG_SMALL_PAGES.to_be_bytes());
        security[0x110..0x114].copy_from_slice(&self.load_address.to_be_bytes());
        security[0x180..0x184].copy_from_slice(&1u32.to_be_bytes());
        security[0x184..0x188].copy_from_slice(&((page_count << 4) | 1).to_be_bytes());
        header.extend_from_slice(&security);

        while header.len() % 0x10 != 0 {
            header.push(0);
        }
        let header_size = header.len() as u32;
        header[0x8..0xC].copy_from_slice(&header_size.to_be_bytes());
        header[0x10..0x14].copy_from_slice(&(security_offset as u32).to_be_bytes());
        header[security_offset..security_offset + 4].copy_from_slice(&header_size.to_be_bytes());

        header.extend_from_slice(&body);
        header
    }
}

/// Encode delta records followed by a terminator
pub fn encode_delta_records(records: &[DeltaRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&record.old_address.to_be_bytes());
        out.extend_from_slice(&record.new_address.to_be_bytes());
        out.extend_from_slice(&record.uncompressed_len.to_be_bytes());
        out.extend_from_slice(&record.compressed_len.to_be_bytes());
        if record.compressed_len > 1 {
            out.extend_from_slice(&record.data);
        }
    }
    out.extend_from_slice(&[0u8; DELTA_RECORD_HEADER_SIZE]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_header_parses() {
        let data = XexBuilder::new()
            .entry_point(0x8200_0100)
            .resource("strings", 0x8200_0800, 0x40)
            .build();

        let header = XexHeader::parse(&data).unwrap();
        assert_eq!(header.magic, crate::XEX2_MAGIC);
        assert_eq!(header.header_count, 3);
        assert_eq!(data.len(), header.header_size as usize + 0x1000);

        let security = SecurityInfo::parse(&data, header.security_offset as usize).unwrap();
        assert_eq!(security.image_size, 0x1000);
        assert_eq!(security.load_address, 0x8200_0000);
        assert_eq!(security.page_descriptors.len(), 1);
        assert_eq!(security.page_descriptors[0].kind, SectionKind::Code);
    }
}
