//! Title-supplied executable modules
//!
//! A XEX loads in two phases. [`UserModule::load_from_memory`] parses the
//! headers and decodes the image (stage [`LoadStage::HeadersOnly`]), then
//! [`UserModule::continue_load`] links it into guest memory once any
//! update patch has been applied. ELF images load in a single phase.

use crate::kernel_state::KernelState;
use crate::objects::{Handle, KernelObject, ObjectType};
use crate::package_resolver::{try_mount_update_package, UPDATE_ROOT};
use ox_core::error::{KernelError, SnapshotError};
use ox_core::{ByteReader, ByteWriter};
use ox_cpu::ModuleRange;
use ox_loader::{
    detect_format, ElfModule, ExecutionInfo, LoadStatus, ModuleFormat,
    OptHeaderValue, XexModule,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Stack given to ELF images
pub const ELF_STACK_SIZE: u32 = 1024 * 1024;

/// Size of the guest loader-data record
pub const LDR_DATA_SIZE: u32 = 0x64;

/// Field offsets inside the loader-data record
pub mod ldr_data {
    pub const DLL_BASE: u32 = 0x18;
    pub const IMAGE_BASE: u32 = 0x1C;
    pub const IMAGE_SIZE: u32 = 0x20;
    pub const FULL_IMAGE_SIZE: u32 = 0x38;
    pub const ENTRY_POINT: u32 = 0x3C;
    pub const XEX_HEADER_BASE: u32 = 0x58;
}

/// Load progress of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    /// Headers parsed, image not yet in guest memory
    HeadersOnly,
    Linked,
    Unloaded,
}

enum ModuleImage {
    Xex(Box<XexModule>),
    Elf(ElfModule),
}

struct ModuleState {
    image: Option<ModuleImage>,
    stage: LoadStage,
    entry_point: u32,
    stack_size: u32,
    is_dll: bool,
    /// Guest copy of the XEX header block, 0 until linked
    guest_xex_header: u32,
}

pub struct UserModule {
    handle: Handle,
    name: String,
    path: String,
    format: ModuleFormat,
    /// Guest loader-data record
    ldr_data: u32,
    state: Mutex<ModuleState>,
}

/// Last component of a `\` or `/` separated guest path
fn base_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

impl UserModule {
    /// Detect the format of `data` and load it.
    ///
    /// Non-patch XEX images return [`LoadStatus::Pending`] and must be
    /// finished with [`Self::continue_load`]. XEX patches and ELF images
    /// complete here.
    pub fn load_from_memory(
        kernel: &KernelState,
        name: &str,
        path: &str,
        data: &[u8],
        length: usize,
    ) -> Result<(Self, LoadStatus), KernelError> {
        let format = detect_format(data).map_err(|e| {
            error!("{}: {}", name, e);
            e
        })?;
        let memory = kernel.memory();
        let handle = kernel.object_table().allocate_handle();
        let ldr_data = memory.system_heap_alloc(LDR_DATA_SIZE)?;

        let (state, status) = match format {
            ModuleFormat::Xex => {
                let xex = XexModule::load(name, path, data, length, kernel.crypto())?;
                let status = if xex.is_patch() {
                    LoadStatus::Complete
                } else {
                    LoadStatus::Pending
                };
                let state = ModuleState {
                    image: Some(ModuleImage::Xex(Box::new(xex))),
                    stage: LoadStage::HeadersOnly,
                    entry_point: 0,
                    stack_size: 0,
                    is_dll: false,
                    guest_xex_header: 0,
                };
                (state, status)
            }
            ModuleFormat::Elf => {
                let elf = ElfModule::load(name, path, data, memory)?;
                kernel.processor().add_module(ModuleRange {
                    name: name.to_string(),
                    low_address: elf.low_address(),
                    high_address: elf.high_address(),
                });
                let state = ModuleState {
                    entry_point: elf.entry_point(),
                    stack_size: ELF_STACK_SIZE,
                    is_dll: false,
                    image: Some(ModuleImage::Elf(elf)),
                    stage: LoadStage::Linked,
                    guest_xex_header: 0,
                };
                (state, LoadStatus::Complete)
            }
        };

        let module = Self {
            handle,
            name: name.to_string(),
            path: path.to_string(),
            format,
            ldr_data,
            state: Mutex::new(state),
        };
        Ok((module, status))
    }

    /// Load a module through the virtual filesystem, applying an update
    /// patch when one is installed.
    pub fn load_from_file(kernel: &KernelState, path: &str) -> Result<Self, KernelError> {
        let file = kernel.file_system().resolve_path(path).ok_or_else(|| {
            error!("File not found: {}", path);
            KernelError::NotFound(path.to_string())
        })?;
        let absolute_path = file.absolute_path();
        let name = base_name(&absolute_path).to_string();
        let data = file.read_all()?;

        let (module, status) =
            Self::load_from_memory(kernel, &name, &absolute_path, &data, data.len())?;
        if status == LoadStatus::Complete {
            return Ok(module);
        }

        if kernel.title_id().is_none() {
            // Seed the title id so content lookups work for this title
            if let Some(info) = module.execution_info() {
                kernel.set_title_id(Some(info.title_id));
            }
        }

        if kernel.apply_patches() {
            let module_path = file.entry.path.clone();
            try_mount_update_package(kernel, &module, &module_path);

            let patch_file = kernel
                .file_system()
                .resolve_path(&format!("{}:\\{}p", UPDATE_ROOT, module_path))
                .or_else(|| kernel.file_system().resolve_path(&format!("{}p", absolute_path)));

            if let Some(patch_file) = patch_file {
                let patch_path = patch_file.absolute_path();
                info!("Loading XEX patch from {}", patch_path);
                module.apply_patch_from(kernel, &patch_path)?;
            }
        }

        module.continue_load(kernel)?;
        Ok(module)
    }

    fn apply_patch_from(&self, kernel: &KernelState, patch_path: &str) -> Result<(), KernelError> {
        let patch = Self::load_from_file(kernel, patch_path).map_err(|e| {
            error!("Failed to load XEX patch {}: {}", patch_path, e);
            KernelError::Unsuccessful(format!("could not load patch {}", patch_path))
        })?;

        let patch_state = patch.state.lock();
        let Some(ModuleImage::Xex(patch_xex)) = patch_state.image.as_ref() else {
            return Err(KernelError::Unsuccessful(format!(
                "{} is not a XEX patch",
                patch_path
            )));
        };

        let mut state = self.state.lock();
        let Some(ModuleImage::Xex(base)) = state.image.as_mut() else {
            return Err(KernelError::InvalidState(format!("{} is not a XEX", self.name)));
        };
        patch_xex.apply_patch(base).map_err(|e| {
            error!("Failed to apply XEX patch: {}", e);
            KernelError::Unsuccessful(format!("could not apply {}: {}", patch_path, e))
        })
    }

    /// Finish loading a XEX: link it into guest memory, copy its header
    /// block into the system heap and fill in the loader-data record.
    /// Already linked modules succeed without doing anything.
    pub fn continue_load(&self, kernel: &KernelState) -> Result<(), KernelError> {
        let memory = kernel.memory();
        let mut state = self.state.lock();
        let stage = state.stage;
        let Some(ModuleImage::Xex(xex)) = state.image.as_mut() else {
            return Err(KernelError::InvalidState(format!(
                "{} has no XEX image to link",
                self.name
            )));
        };
        match stage {
            LoadStage::Linked => return Ok(()),
            LoadStage::Unloaded => {
                return Err(KernelError::InvalidState(format!("{} was unloaded", self.name)))
            }
            LoadStage::HeadersOnly => {}
        }

        xex.load_continue(memory, kernel.export_resolver())?;

        let header = xex.header_bytes();
        let guest_xex_header = memory.system_heap_alloc(header.len() as u32)?;
        memory.write_bytes(guest_xex_header, header)?;

        let entry_point = xex.entry_point().unwrap_or(0);
        let stack_size = xex.default_stack_size();
        let is_dll = xex.is_dll();
        let image_base = xex.base_address();
        let image_size = xex.image_size();

        memory.write_be32(self.ldr_data + ldr_data::DLL_BASE, 0)?;
        memory.write_be32(self.ldr_data + ldr_data::IMAGE_BASE, image_base)?;
        memory.write_be32(self.ldr_data + ldr_data::IMAGE_SIZE, image_size)?;
        memory.write_be32(self.ldr_data + ldr_data::FULL_IMAGE_SIZE, image_size)?;
        memory.write_be32(self.ldr_data + ldr_data::ENTRY_POINT, entry_point)?;
        memory.write_be32(self.ldr_data + ldr_data::XEX_HEADER_BASE, guest_xex_header)?;

        kernel.processor().add_module(ModuleRange {
            name: self.name.clone(),
            low_address: image_base,
            high_address: image_base.wrapping_add(image_size),
        });

        state.entry_point = entry_point;
        state.stack_size = stack_size;
        state.is_dll = is_dll;
        state.guest_xex_header = guest_xex_header;
        state.stage = LoadStage::Linked;

        debug!(
            "{} linked: entry=0x{:08X} stack=0x{:X}{}",
            self.name,
            entry_point,
            stack_size,
            if is_dll { " (dll)" } else { "" }
        );
        Ok(())
    }

    /// Remove the module from guest memory. Succeeds without doing anything
    /// when the module is not linked.
    pub fn unload(&self, kernel: &KernelState) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.stage != LoadStage::Linked {
            return Ok(());
        }
        match state.image.as_mut() {
            Some(ModuleImage::Xex(xex)) => xex.unload(kernel.memory())?,
            Some(ModuleImage::Elf(elf)) => {
                let size = elf.high_address().saturating_sub(elf.low_address());
                if size != 0 {
                    kernel.memory().decommit(elf.low_address(), size)?;
                }
            }
            None => {
                return Err(KernelError::InvalidState(format!(
                    "{} has no image",
                    self.name
                )))
            }
        }
        kernel.processor().remove_module(&self.name);
        state.stage = LoadStage::Unloaded;
        debug!("Unloaded {}", self.name);
        Ok(())
    }

    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        let state = self.state.lock();
        stream.write_u32(self.handle)?;
        stream.write_string(&self.name)?;
        stream.write_string(&self.path)?;
        stream.write_u8(match self.format {
            ModuleFormat::Xex => 0,
            ModuleFormat::Elf => 1,
        })?;
        stream.write_u8(match state.stage {
            LoadStage::HeadersOnly => 0,
            LoadStage::Linked => 1,
            LoadStage::Unloaded => 2,
        })?;
        stream.write_u32(self.ldr_data)?;
        stream.write_u32(state.guest_xex_header)?;
        stream.write_u32(state.entry_point)?;
        stream.write_u32(state.stack_size)?;
        stream.write_bool(state.is_dll)?;
        if let Some(ModuleImage::Xex(xex)) = state.image.as_ref() {
            stream.write_blob(xex.header_bytes())?;
        }
        Ok(())
    }

    /// Recreate a saved module at its saved guest addresses.
    ///
    /// Nothing is allocated and no module range is registered: the memory
    /// blob brings back the image, header copy and loader-data record, and
    /// the processor blob brings back the ranges.
    pub fn restore(kernel: &KernelState, stream: &mut ByteReader) -> Result<Self, SnapshotError> {
        let handle = stream.read_u32()?;
        let name = stream.read_string()?;
        let path = stream.read_string()?;
        let format = match stream.read_u8()? {
            0 => ModuleFormat::Xex,
            1 => ModuleFormat::Elf,
            other => return Err(SnapshotError::Invalid(format!("module format {}", other))),
        };
        let stage = match stream.read_u8()? {
            0 => LoadStage::HeadersOnly,
            1 => LoadStage::Linked,
            2 => LoadStage::Unloaded,
            other => return Err(SnapshotError::Invalid(format!("module stage {}", other))),
        };
        let ldr_data = stream.read_u32()?;
        let guest_xex_header = stream.read_u32()?;
        let entry_point = stream.read_u32()?;
        let stack_size = stream.read_u32()?;
        let is_dll = stream.read_bool()?;

        let image = match format {
            ModuleFormat::Xex => {
                let header = stream.read_blob()?;
                let xex = XexModule::restore_linked(&name, &path, header, kernel.crypto())
                    .map_err(|e| SnapshotError::Invalid(format!("{}: {}", name, e)))?;
                ModuleImage::Xex(Box::new(xex))
            }
            ModuleFormat::Elf => {
                let data = kernel
                    .file_system()
                    .resolve_path(&path)
                    .ok_or_else(|| SnapshotError::Invalid(format!("{} is gone", path)))?
                    .read_all()
                    .map_err(|e| SnapshotError::Invalid(format!("{}: {}", path, e)))?;
                let elf = ElfModule::load(&name, &path, &data, kernel.memory())
                    .map_err(|e| SnapshotError::Invalid(format!("{}: {}", name, e)))?;
                ModuleImage::Elf(elf)
            }
        };

        debug!("Restored module {} at ldr_data 0x{:08X}", name, ldr_data);
        Ok(Self {
            handle,
            name,
            path,
            format,
            ldr_data,
            state: Mutex::new(ModuleState {
                image: Some(image),
                stage,
                entry_point,
                stack_size,
                is_dll,
                guest_xex_header,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn stage(&self) -> LoadStage {
        self.state.lock().stage
    }

    pub fn is_patch(&self) -> bool {
        matches!(
            self.state.lock().image.as_ref(),
            Some(ModuleImage::Xex(xex)) if xex.is_patch()
        )
    }

    pub fn entry_point(&self) -> u32 {
        self.state.lock().entry_point
    }

    pub fn stack_size(&self) -> u32 {
        self.state.lock().stack_size
    }

    pub fn is_dll(&self) -> bool {
        self.state.lock().is_dll
    }

    /// Guest address of the loader-data record
    pub fn ldr_data(&self) -> u32 {
        self.ldr_data
    }

    pub fn guest_xex_header(&self) -> u32 {
        self.state.lock().guest_xex_header
    }

    /// Look up an optional header against the guest copy of the header
    /// block. ELF modules have no optional headers.
    pub fn get_opt_header(&self, key: u32) -> Option<OptHeaderValue> {
        let state = self.state.lock();
        match state.image.as_ref() {
            Some(ModuleImage::Xex(xex)) => xex.get_opt_header(key, state.guest_xex_header),
            _ => None,
        }
    }

    pub fn execution_info(&self) -> Option<ExecutionInfo> {
        match self.state.lock().image.as_ref() {
            Some(ModuleImage::Xex(xex)) => xex.execution_info(),
            _ => None,
        }
    }

    /// Title id from the execution info, 0 when absent
    pub fn title_id(&self) -> u32 {
        self.execution_info().map(|info| info.title_id).unwrap_or(0)
    }

    /// Run `f` against the XEX translation unit, if this is a XEX
    pub fn with_xex<R>(&self, f: impl FnOnce(&XexModule) -> R) -> Option<R> {
        match self.state.lock().image.as_ref() {
            Some(ModuleImage::Xex(xex)) => Some(f(xex)),
            _ => None,
        }
    }

    /// Address and size of a named resource. Names compare on their first
    /// 8 bytes, case-sensitively.
    pub fn get_section(&self, name: &str) -> Result<(u32, u32), KernelError> {
        let wanted = &name.as_bytes()[..name.len().min(8)];
        let resources = self
            .with_xex(|xex| xex.resources())
            .ok_or_else(|| KernelError::NotFound(format!("{} has no resources", self.name)))?;
        resources
            .iter()
            .find(|res| res.name.as_bytes() == wanted)
            .map(|res| (res.address, res.size))
            .ok_or_else(|| KernelError::NotFound(format!("section {}", name)))
    }

    /// Log the module headers
    pub fn dump(&self) {
        if self.with_xex(|xex| xex.dump()).is_none() {
            info!("Module {} ({}): ELF image", self.name, self.path);
        }
    }
}

impl KernelObject for UserModule {
    fn object_type(&self) -> ObjectType {
        ObjectType::Module
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for UserModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserModule")
            .field("handle", &self.handle)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("stage", &self.stage())
            .finish()
    }
}
