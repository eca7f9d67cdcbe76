//! XEX loading, linking and patching

use ox_core::error::LoaderError;
use ox_cpu::{Export, ExportResolver};
use ox_loader::xex::{header_keys, DeltaRecord, ExecutionInfo, ImportRecordType, XexVersion};
use ox_loader::xex_module::{PPC_BLR, PPC_SC, UNRESOLVED_VARIABLE};
use ox_loader::{NullCrypto, OptHeaderValue, XexBuilder, XexModule};
use ox_memory::MemoryManager;
use std::sync::Arc;

fn exec_info(title_id: u32, version: u32) -> ExecutionInfo {
    ExecutionInfo {
        title_id,
        version: XexVersion(version),
        disc_number: 1,
        disc_count: 1,
        ..Default::default()
    }
}

fn load(data: &[u8]) -> XexModule {
    XexModule::load("default.xex", "game:\\default.xex", data, data.len(), Arc::new(NullCrypto))
        .unwrap()
}

#[test]
fn test_opt_header_lookup() {
    let data = XexBuilder::new()
        .entry_point(0x8200_0100)
        .image_base(0x8300_0000)
        .execution_info(exec_info(0x4D53_07E6, 0x2000_0000))
        .build();
    let module = load(&data);

    // Inline
    assert_eq!(
        module.get_opt_header(header_keys::ENTRY_POINT, 0x8000_0000),
        Some(OptHeaderValue::Inline(0x8200_0100))
    );

    // Pointer to the value slot
    let index = module
        .opt_headers()
        .iter()
        .position(|h| h.key == header_keys::IMAGE_BASE_ADDRESS)
        .unwrap();
    assert_eq!(
        module.get_opt_header(header_keys::IMAGE_BASE_ADDRESS, 0x8000_0000),
        Some(OptHeaderValue::Pointer(0x8000_0000 + 0x18 + index as u32 * 8 + 4))
    );
    assert_eq!(module.base_address(), 0x8300_0000);

    // Offset from the header base
    let raw = module
        .opt_headers()
        .iter()
        .find(|h| h.key == header_keys::EXECUTION_INFO)
        .unwrap()
        .value;
    assert_eq!(
        module.get_opt_header(header_keys::EXECUTION_INFO, 0x8000_0000),
        Some(OptHeaderValue::Offset(0x8000_0000 + raw))
    );
    assert_eq!(module.execution_info().unwrap().title_id, 0x4D53_07E6);

    assert_eq!(module.get_opt_header(header_keys::TLS_INFO, 0), None);
}

#[test]
fn test_default_stack_size_and_flags() {
    let module = load(&XexBuilder::new().build());
    assert_eq!(module.default_stack_size(), 1024 * 1024);
    assert!(!module.is_dll());
    assert!(!module.is_patch());

    let module = load(&XexBuilder::new().stack_size(0x40000).build());
    assert_eq!(module.default_stack_size(), 0x40000);
}

#[test]
fn test_basic_compression_decodes() {
    let mut image = vec![0u8; 0x2000];
    image[0x10..0x14].copy_from_slice(&[1, 2, 3, 4]);
    image[0x1800] = 0xAA;
    let data = XexBuilder::new()
        .image(image.clone())
        .basic_compression(true)
        .build();
    let module = load(&data);
    assert_eq!(module.image(), &image[..]);
}

#[test]
fn test_basic_compression_rejects_oversized_zero_run() {
    let mut image = vec![0u8; 0x1000];
    image[0] = 0x11;
    let mut data = XexBuilder::new().image(image).basic_compression(true).build();

    // FILE_FORMAT_INFO is the first table entry; its first block is (1, 0xFFF)
    let info = u32::from_be_bytes(data[0x1C..0x20].try_into().unwrap()) as usize;
    assert_eq!(&data[info + 12..info + 16], &0xFFFu32.to_be_bytes());
    data[info + 12..info + 16].copy_from_slice(&0xFFFF_0000u32.to_be_bytes());

    let result =
        XexModule::load("default.xex", "game:\\default.xex", &data, data.len(), Arc::new(NullCrypto));
    assert!(matches!(result, Err(LoaderError::InvalidXex(_))));
}

#[test]
fn test_load_continue_links_imports() {
    let memory = MemoryManager::new();
    let exports = ExportResolver::new();
    exports.register_table(
        "xboxkrnl.exe",
        vec![
            Export::function(0x01, "DbgBreakPoint"),
            Export::variable(0x1B, "ExLoadedImageName"),
        ],
    );
    exports.set_variable_mapping("xboxkrnl.exe", 0x1B, 0x8000_2000);

    let mut image = vec![0u8; 0x1000];
    // thunk record for ordinal 1
    image[0x100..0x104].copy_from_slice(&0x0100_0001u32.to_be_bytes());
    // variable record for ordinal 0x1B
    image[0x110..0x114].copy_from_slice(&0x0000_001Bu32.to_be_bytes());
    // variable nobody exports
    image[0x120..0x124].copy_from_slice(&0x0000_0099u32.to_be_bytes());

    let data = XexBuilder::new()
        .image(image)
        .import_library(
            "xboxkrnl.exe",
            0x2000_0000,
            vec![0x8200_0100, 0x8200_0110, 0x8200_0120],
        )
        .build();
    let mut module = load(&data);
    module.load_continue(&memory, &exports).unwrap();

    assert!(module.loaded());
    assert_eq!(memory.read_be32(0x8200_0100).unwrap(), PPC_SC);
    assert_eq!(memory.read_be32(0x8200_0104).unwrap(), PPC_BLR);
    assert_eq!(memory.read_be32(0x8200_0110).unwrap(), 0x8000_2000);
    assert_eq!(memory.read_be32(0x8200_0120).unwrap(), UNRESOLVED_VARIABLE);

    let imports = module.imports();
    assert_eq!(imports.len(), 3);
    assert_eq!(imports[0].record_type, ImportRecordType::Thunk);
    assert!(imports[0].resolved);
    assert!(imports[1].resolved);
    assert!(!imports[2].resolved);

    module.unload(&memory).unwrap();
    assert!(!module.loaded());
    assert!(!memory.is_committed(0x8200_0000));
}

#[test]
fn test_headers_only_load_cannot_link() {
    let data = XexBuilder::new().build();
    let mut module =
        XexModule::load("default.xex", "game:\\default.xex", &data, 0, Arc::new(NullCrypto)).unwrap();
    assert!(module.image().is_empty());
    let memory = MemoryManager::new();
    assert!(matches!(
        module.load_continue(&memory, &ExportResolver::new()),
        Err(LoaderError::InvalidStage(_))
    ));
}

#[test]
fn test_patch_applicability() {
    let base = load(
        &XexBuilder::new()
            .execution_info(exec_info(0x4D53_07E6, 0x2000_0000))
            .build(),
    );

    let matching = load(
        &XexBuilder::new()
            .execution_info(exec_info(0x4D53_07E6, 0x2000_0100))
            .delta_patch(0x2000_0000, 0x2000_0100)
            .build(),
    );
    assert!(matching.is_patch());
    assert!(matching.is_patch_applicable(&base));

    let wrong_version = load(
        &XexBuilder::new()
            .delta_patch(0x1000_0000, 0x2000_0100)
            .build(),
    );
    assert!(!wrong_version.is_patch_applicable(&base));

    let wrong_title = load(
        &XexBuilder::new()
            .execution_info(exec_info(0x1111_1111, 0x2000_0100))
            .delta_patch(0x2000_0000, 0x2000_0100)
            .build(),
    );
    assert!(!wrong_title.is_patch_applicable(&base));

    // Patches never apply to patches, and a base never applies as a patch
    assert!(!matching.is_patch_applicable(&matching));
    assert!(!base.is_patch_applicable(&base));
}

#[test]
fn test_apply_image_delta() {
    let mut image = vec![0u8; 0x1000];
    image[0..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
    image[0x20..0x24].copy_from_slice(&[1, 1, 1, 1]);
    let mut base = load(
        &XexBuilder::new()
            .image(image)
            .execution_info(exec_info(0x4D53_07E6, 0x2000_0000))
            .build(),
    );

    let records = [
        // copy the first word to 0x40
        DeltaRecord {
            old_address: 0x8200_0000,
            new_address: 0x8200_0040,
            uncompressed_len: 4,
            compressed_len: 1,
            data: Vec::new(),
        },
        // clear 0x20
        DeltaRecord {
            old_address: 0,
            new_address: 0x8200_0020,
            uncompressed_len: 4,
            compressed_len: 0,
            data: Vec::new(),
        },
    ];
    let patch = load(
        &XexBuilder::new()
            .delta_patch(0x2000_0000, 0x2000_0100)
            .delta_records(&records)
            .build(),
    );

    patch.apply_patch(&mut base).unwrap();
    assert_eq!(&base.image()[0x40..0x44], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(&base.image()[0x20..0x24], &[0, 0, 0, 0]);
}

#[test]
fn test_apply_header_delta_changes_entry_point() {
    let base_data = XexBuilder::new()
        .entry_point(0x8200_0100)
        .execution_info(exec_info(0x4D53_07E6, 0x2000_0000))
        .build();
    let mut base = load(&base_data);
    let header_size = base.xex_header().header_size;

    // Zero the entry point's inline value slot
    let index = base
        .opt_headers()
        .iter()
        .position(|h| h.key == header_keys::ENTRY_POINT)
        .unwrap() as u32;
    let slot = 0x18 + index * 8 + 4;

    let records = [DeltaRecord {
        old_address: 0,
        new_address: slot,
        uncompressed_len: 4,
        compressed_len: 0,
        data: Vec::new(),
    }];
    let patch = load(
        &XexBuilder::new()
            .delta_patch_with_headers(
                0x2000_0000,
                0x2000_0100,
                Some((header_size, 0, header_size, 0)),
                &records,
            )
            .build(),
    );

    patch.apply_patch(&mut base).unwrap();
    assert_eq!(base.entry_point(), Some(0));
    assert_eq!(base.xex_header().header_size, header_size);
}
