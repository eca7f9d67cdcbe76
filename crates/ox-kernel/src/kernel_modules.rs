//! Built-in kernel modules
//!
//! Titles import from `xboxkrnl.exe`, `xam.xex` and `xbdm.xex`. Only the
//! export tables live here: functions are linked as syscall thunks and
//! variables get zeroed storage in the system heap.

use ox_core::error::KernelError;
use ox_cpu::{Export, ExportResolver};
use ox_memory::MemoryManager;
use tracing::debug;

pub const XBOXKRNL: &str = "xboxkrnl.exe";
pub const XAM: &str = "xam.xex";
pub const XBDM: &str = "xbdm.xex";

/// xboxkrnl variable ordinals
pub mod ordinals {
    pub const KE_DEBUG_MONITOR_DATA: u16 = 0x0059;
    pub const XBOX_HARDWARE_INFO: u16 = 0x0156;
    pub const XBOX_KRNL_VERSION: u16 = 0x0158;
    pub const XEX_EXECUTABLE_MODULE_HANDLE: u16 = 0x0193;
    pub const EX_LOADED_COMMAND_LINE: u16 = 0x01AE;
    pub const EX_LOADED_IMAGE_NAME: u16 = 0x01AF;
}

/// Size of the command line and image name buffers
pub const LOADED_STRING_SIZE: u32 = 0x100;

/// Kernel version reported to titles (2.0.17559.0)
const KERNEL_VERSION: [u16; 4] = [2, 0, 17559, 0];

/// Guest addresses of the xboxkrnl variables the kernel writes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelVariables {
    pub executable_module_handle: u32,
    pub loaded_command_line: u32,
    pub loaded_image_name: u32,
    pub kernel_version: u32,
}

pub fn is_kernel_module(name: &str) -> bool {
    [XBOXKRNL, XAM, XBDM]
        .iter()
        .any(|module| module.eq_ignore_ascii_case(name))
}

fn xboxkrnl_exports() -> Vec<Export> {
    use ordinals::*;
    vec![
        Export::function(0x0001, "DbgBreakPoint"),
        Export::function(0x0002, "DbgBreakPointWithStatus"),
        Export::function(0x0003, "DbgPrint"),
        Export::function(0x000D, "ExCreateThread"),
        Export::function(0x0013, "ExGetXConfigSetting"),
        Export::function(0x0023, "ExTerminateThread"),
        Export::variable(KE_DEBUG_MONITOR_DATA, "KeDebugMonitorData"),
        Export::function(0x005E, "KeBugCheck"),
        Export::function(0x005F, "KeBugCheckEx"),
        Export::function(0x0066, "KeGetCurrentProcessType"),
        Export::function(0x00CC, "NtAllocateVirtualMemory"),
        Export::function(0x00CD, "NtCancelTimer"),
        Export::function(0x00CF, "NtClose"),
        Export::function(0x00D2, "NtCreateFile"),
        Export::function(0x00DC, "NtFreeVirtualMemory"),
        Export::function(0x00DA, "NtDuplicateObject"),
        Export::function(0x00E1, "NtQueryInformationFile"),
        Export::function(0x00EA, "NtReadFile"),
        Export::function(0x00FF, "NtWaitForSingleObjectEx"),
        Export::function(0x0100, "NtWriteFile"),
        Export::function(0x012C, "RtlInitAnsiString"),
        Export::variable(XBOX_HARDWARE_INFO, "XboxHardwareInfo"),
        Export::variable(XBOX_KRNL_VERSION, "XboxKrnlVersion"),
        Export::function(0x0191, "XexCheckExecutablePrivilege"),
        Export::function(0x0192, "XexGetModuleHandle"),
        Export::variable(XEX_EXECUTABLE_MODULE_HANDLE, "XexExecutableModuleHandle"),
        Export::function(0x0194, "XexGetProcedureAddress"),
        Export::function(0x0195, "XexGetModuleSection"),
        Export::variable(EX_LOADED_COMMAND_LINE, "ExLoadedCommandLine"),
        Export::variable(EX_LOADED_IMAGE_NAME, "ExLoadedImageName"),
    ]
}

fn xam_exports() -> Vec<Export> {
    vec![
        Export::function(0x01A4, "XamLoaderLaunchTitle"),
        Export::function(0x01A5, "XamLoaderTerminateTitle"),
        Export::function(0x01A6, "XamLoaderGetLaunchDataSize"),
        Export::function(0x01A7, "XamLoaderGetLaunchData"),
        Export::function(0x01A8, "XamLoaderSetLaunchData"),
        Export::function(0x0210, "XamContentCreateEx"),
        Export::function(0x0212, "XamContentClose"),
        Export::function(0x0258, "XamUserGetSigninState"),
        Export::function(0x0287, "XamShowMessageBoxUI"),
    ]
}

fn xbdm_exports() -> Vec<Export> {
    vec![
        Export::function(0x0001, "DmAllocatePool"),
        Export::function(0x0009, "DmCaptureStackBackTrace"),
        Export::function(0x0014, "DmFreePool"),
        Export::function(0x0023, "DmGetXboxName"),
        Export::function(0x0024, "DmIsDebuggerPresent"),
        Export::function(0x0035, "DmRegisterCommandProcessor"),
        Export::function(0x003E, "DmSendNotificationString"),
    ]
}

fn alloc_variable(
    memory: &MemoryManager,
    exports: &ExportResolver,
    ordinal: u16,
    size: u32,
) -> Result<u32, KernelError> {
    let address = memory.system_heap_alloc(size)?;
    if !exports.set_variable_mapping(XBOXKRNL, ordinal, address) {
        return Err(KernelError::NotFound(format!(
            "{}@{:04X}",
            XBOXKRNL, ordinal
        )));
    }
    Ok(address)
}

/// Register the built-in export tables and give the kernel variables
/// guest storage
pub fn register_kernel_modules(
    memory: &MemoryManager,
    exports: &ExportResolver,
) -> Result<KernelVariables, KernelError> {
    use ordinals::*;

    exports.register_table(XBOXKRNL, xboxkrnl_exports());
    exports.register_table(XAM, xam_exports());
    exports.register_table(XBDM, xbdm_exports());

    // No debug monitor is present
    alloc_variable(memory, exports, KE_DEBUG_MONITOR_DATA, 4)?;
    alloc_variable(memory, exports, XBOX_HARDWARE_INFO, 0x10)?;

    let kernel_version = alloc_variable(memory, exports, XBOX_KRNL_VERSION, 8)?;
    for (i, part) in KERNEL_VERSION.iter().enumerate() {
        memory.write_be16(kernel_version + i as u32 * 2, *part)?;
    }

    let variables = KernelVariables {
        executable_module_handle: alloc_variable(memory, exports, XEX_EXECUTABLE_MODULE_HANDLE, 4)?,
        loaded_command_line: alloc_variable(
            memory,
            exports,
            EX_LOADED_COMMAND_LINE,
            LOADED_STRING_SIZE,
        )?,
        loaded_image_name: alloc_variable(memory, exports, EX_LOADED_IMAGE_NAME, LOADED_STRING_SIZE)?,
        kernel_version,
    };

    debug!(
        "Registered kernel modules: {}, {}, {}",
        XBOXKRNL, XAM, XBDM
    );
    Ok(variables)
}

/// Write a NUL-terminated string into a fixed-size kernel buffer
pub fn write_loaded_string(
    memory: &MemoryManager,
    address: u32,
    value: &str,
) -> Result<(), KernelError> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.truncate(LOADED_STRING_SIZE as usize - 1);
    bytes.resize(LOADED_STRING_SIZE as usize, 0);
    memory.write_bytes(address, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ox_cpu::ExportKind;

    #[test]
    fn test_register_maps_variables() {
        let memory = MemoryManager::new();
        let exports = ExportResolver::new();
        let variables = register_kernel_modules(&memory, &exports).unwrap();

        assert!(exports.has_library("XBOXKRNL.EXE"));
        assert!(exports.has_library(XAM));
        assert!(exports.has_library(XBDM));

        let handle = exports
            .get_export(XBOXKRNL, ordinals::XEX_EXECUTABLE_MODULE_HANDLE)
            .unwrap();
        assert_eq!(handle.kind, ExportKind::Variable);
        assert_eq!(handle.variable_ptr, variables.executable_module_handle);
        assert_eq!(memory.read_be16(variables.kernel_version).unwrap(), 2);
    }

    #[test]
    fn test_loaded_string_is_truncated() {
        let memory = MemoryManager::new();
        let exports = ExportResolver::new();
        let variables = register_kernel_modules(&memory, &exports).unwrap();

        let long = "x".repeat(0x200);
        write_loaded_string(&memory, variables.loaded_image_name, &long).unwrap();
        let stored = memory
            .read_bytes(variables.loaded_image_name, LOADED_STRING_SIZE)
            .unwrap();
        assert_eq!(stored[LOADED_STRING_SIZE as usize - 1], 0);
        assert_eq!(stored[0], b'x');
    }

    #[test]
    fn test_is_kernel_module() {
        assert!(is_kernel_module("xboxkrnl.exe"));
        assert!(is_kernel_module("XAM.XEX"));
        assert!(!is_kernel_module("default.xex"));
    }
}
