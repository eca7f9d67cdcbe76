//! Shared kernel state
//!
//! Everything the running title sees as "the system": the object table,
//! the executable module and its user modules, guest threads, the content
//! manager and the kernel variables written at launch.

use crate::content::ContentManager;
use crate::kernel_modules::{self, KernelVariables};
use crate::objects::{Handle, KernelObject, ObjectTable, ObjectType};
use crate::thread::{ThreadParams, XThread};
use crate::user_module::UserModule;
use ox_core::error::{KernelError, SnapshotError};
use ox_core::{ByteReader, ByteWriter};
use ox_cpu::{ExportResolver, Processor, ThreadContext};
use ox_loader::xex_module::DEFAULT_STACK_SIZE;
use ox_loader::XexCrypto;
use ox_memory::MemoryManager;
use ox_vfs::VirtualFileSystem;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot marker for the kernel blob ('KRNL')
pub const KERNEL_SNAPSHOT_MAGIC: u32 = 0x4B52_4E4C;

/// Room reserved above the initial stack pointer
const STACK_FRAME_RESERVE: u32 = 0x80;

/// A follow-up title requested by the running one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRequest {
    pub path: String,
    pub flags: u32,
}

pub struct KernelState {
    memory: Arc<MemoryManager>,
    processor: Arc<Processor>,
    file_system: Arc<VirtualFileSystem>,
    content_manager: ContentManager,
    crypto: Arc<dyn XexCrypto>,
    apply_patches: AtomicBool,
    title_id: Mutex<Option<u32>>,
    objects: ObjectTable,
    variables: Mutex<Option<KernelVariables>>,
    executable_module: RwLock<Option<Arc<UserModule>>>,
    user_modules: RwLock<Vec<Arc<UserModule>>>,
    /// Held while threads are created or walked for suspend/resume
    thread_table: Mutex<()>,
    next_thread_id: AtomicU32,
    title_request: Mutex<Option<TitleRequest>>,
}

impl KernelState {
    pub fn new(
        memory: Arc<MemoryManager>,
        processor: Arc<Processor>,
        file_system: Arc<VirtualFileSystem>,
        content_root: impl Into<PathBuf>,
        crypto: Arc<dyn XexCrypto>,
    ) -> Self {
        let content_manager = ContentManager::new(content_root, Arc::clone(&file_system));
        Self {
            memory,
            processor,
            file_system,
            content_manager,
            crypto,
            apply_patches: AtomicBool::new(true),
            title_id: Mutex::new(None),
            objects: ObjectTable::new(),
            variables: Mutex::new(None),
            executable_module: RwLock::new(None),
            user_modules: RwLock::new(Vec::new()),
            thread_table: Mutex::new(()),
            next_thread_id: AtomicU32::new(1),
            title_request: Mutex::new(None),
        }
    }

    /// Register xboxkrnl, xam and xbdm with the export resolver
    pub fn register_kernel_modules(&self) -> Result<(), KernelError> {
        let variables =
            kernel_modules::register_kernel_modules(&self.memory, self.processor.export_resolver())?;
        *self.variables.lock() = Some(variables);
        Ok(())
    }

    pub fn is_kernel_module(&self, name: &str) -> bool {
        kernel_modules::is_kernel_module(name)
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn export_resolver(&self) -> &Arc<ExportResolver> {
        self.processor.export_resolver()
    }

    pub fn file_system(&self) -> &Arc<VirtualFileSystem> {
        &self.file_system
    }

    pub fn content_manager(&self) -> &ContentManager {
        &self.content_manager
    }

    pub fn crypto(&self) -> Arc<dyn XexCrypto> {
        Arc::clone(&self.crypto)
    }

    pub fn object_table(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn apply_patches(&self) -> bool {
        self.apply_patches.load(Ordering::Relaxed)
    }

    pub fn set_apply_patches(&self, apply: bool) {
        self.apply_patches.store(apply, Ordering::Relaxed);
    }

    pub fn title_id(&self) -> Option<u32> {
        *self.title_id.lock()
    }

    pub fn set_title_id(&self, title_id: Option<u32>) {
        *self.title_id.lock() = title_id;
    }

    pub fn executable_module(&self) -> Option<Arc<UserModule>> {
        self.executable_module.read().clone()
    }

    pub fn user_modules(&self) -> Vec<Arc<UserModule>> {
        self.user_modules.read().clone()
    }

    /// A loaded module by guest path or name, case-insensitively
    pub fn get_module(&self, name: &str) -> Option<Arc<UserModule>> {
        self.user_modules
            .read()
            .iter()
            .find(|m| m.path().eq_ignore_ascii_case(name) || m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Load (or find the already loaded) module at `path`
    pub fn load_user_module(&self, path: &str) -> Result<Arc<UserModule>, KernelError> {
        let resolved = self
            .file_system
            .resolve_path(path)
            .ok_or_else(|| KernelError::NotFound(path.to_string()))?;
        if let Some(existing) = self.get_module(&resolved.absolute_path()) {
            debug!("{} is already loaded", path);
            return Ok(existing);
        }

        let module = Arc::new(UserModule::load_from_file(self, path)?);
        self.objects.register(module.clone());
        self.user_modules.write().push(Arc::clone(&module));
        info!("Loaded module {} ({})", module.name(), module.path());
        Ok(module)
    }

    /// Make `module` the executable module and start its main thread
    pub fn launch_module(&self, module: &Arc<UserModule>) -> Result<Arc<XThread>, KernelError> {
        if module.is_dll() {
            return Err(KernelError::InvalidState(format!(
                "{} is a library and cannot be launched",
                module.name()
            )));
        }
        *self.executable_module.write() = Some(Arc::clone(module));

        if let Some(variables) = *self.variables.lock() {
            self.memory
                .write_be32(variables.executable_module_handle, module.ldr_data())?;
            kernel_modules::write_loaded_string(
                &self.memory,
                variables.loaded_image_name,
                module.path(),
            )?;
            kernel_modules::write_loaded_string(
                &self.memory,
                variables.loaded_command_line,
                &format!("\"{}\"", module.name()),
            )?;
        }

        let stack_size = match module.stack_size() {
            0 => DEFAULT_STACK_SIZE,
            size => size,
        };
        let thread = self.spawn_thread("Main XThread", module.entry_point(), stack_size, true, true)?;
        info!(
            "Launched {} at 0x{:08X} on thread {:08X}",
            module.name(),
            module.entry_point(),
            thread.handle()
        );
        Ok(thread)
    }

    /// Allocate a stack, register a new guest thread and start it
    pub fn spawn_thread(
        &self,
        name: &str,
        entry_point: u32,
        stack_size: u32,
        is_main: bool,
        can_debugger_suspend: bool,
    ) -> Result<Arc<XThread>, KernelError> {
        let _table = self.thread_table.lock();
        let stack_base = self.memory.stack_alloc(stack_size)?;
        let mut context = ThreadContext::new();
        context.r[1] = u64::from(stack_base + stack_size - STACK_FRAME_RESERVE);

        let params = ThreadParams {
            name: name.to_string(),
            thread_id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
            entry_point,
            stack_base,
            stack_size,
            is_main,
            can_debugger_suspend,
        };
        let thread = XThread::new(self.objects.allocate_handle(), params, context);
        self.objects.register(thread.clone());
        if let Err(e) = thread.start(Arc::clone(&self.processor)) {
            let _ = self.objects.unregister(thread.handle());
            return Err(e);
        }
        Ok(thread)
    }

    /// Live guest threads in handle order
    pub fn threads(&self) -> Vec<Arc<XThread>> {
        self.objects.objects_of::<XThread>(ObjectType::Thread)
    }

    pub fn main_thread(&self) -> Option<Arc<XThread>> {
        self.threads().into_iter().find(|t| t.is_main())
    }

    /// Run `f` over the guest threads while no thread can be created
    pub fn with_thread_table<R>(&self, f: impl FnOnce(&[Arc<XThread>]) -> R) -> R {
        let _table = self.thread_table.lock();
        f(&self.threads())
    }

    pub fn get_thread(&self, handle: Handle) -> Result<Arc<XThread>, KernelError> {
        self.objects.get::<XThread>(handle)
    }

    /// Tear down the running title: stop its threads, unload its modules
    /// and close any content it had open
    pub fn terminate_title(&self) {
        let threads = self.threads();
        for thread in &threads {
            if thread.is_current() {
                thread.request_terminate();
            } else {
                thread.terminate();
            }
            if let Err(e) = self.objects.unregister(thread.handle()) {
                warn!("{}", e);
            }
        }

        let modules: Vec<_> = self.user_modules.write().drain(..).collect();
        for module in modules.iter().rev() {
            if let Err(e) = module.unload(self) {
                warn!("Failed to unload {}: {}", module.name(), e);
            }
            if let Err(e) = self.objects.unregister(module.handle()) {
                warn!("{}", e);
            }
        }

        *self.executable_module.write() = None;
        self.content_manager.close_all();
        self.set_title_id(None);
        info!(
            "Title terminated ({} threads, {} modules)",
            threads.len(),
            modules.len()
        );
    }

    /// Record a follow-up title launch
    pub fn request_title_launch(&self, path: &str, flags: u32) {
        info!("Title requested launch of {}", path);
        *self.title_request.lock() = Some(TitleRequest {
            path: path.to_string(),
            flags,
        });
    }

    pub fn has_title_request(&self) -> bool {
        self.title_request.lock().is_some()
    }

    pub fn take_title_request(&self) -> Option<TitleRequest> {
        self.title_request.lock().take()
    }

    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(KERNEL_SNAPSHOT_MAGIC)?;
        let title_id = self.title_id();
        stream.write_bool(title_id.is_some())?;
        if let Some(title_id) = title_id {
            stream.write_u32(title_id)?;
        }

        let executable = self.executable_module();
        stream.write_u32(executable.as_ref().map(|m| m.handle()).unwrap_or(0))?;

        let modules = self.user_modules();
        stream.write_u32(modules.len() as u32)?;
        for module in &modules {
            module.save(stream)?;
        }

        let threads = self.threads();
        stream.write_u32(threads.len() as u32)?;
        for thread in &threads {
            thread.save(stream)?;
        }
        debug!(
            "Saved kernel state: {} modules, {} threads",
            modules.len(),
            threads.len()
        );
        Ok(())
    }

    /// Recreate saved modules and threads. Modules keep their saved guest
    /// addresses and must be followed by the memory blob. Threads come back
    /// started but suspended; the caller resumes them.
    pub fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError> {
        let magic = stream.read_u32()?;
        if magic != KERNEL_SNAPSHOT_MAGIC {
            return Err(SnapshotError::Invalid(format!(
                "kernel blob marker 0x{:08x}",
                magic
            )));
        }
        let title_id = match stream.read_bool()? {
            true => Some(stream.read_u32()?),
            false => None,
        };
        self.set_title_id(title_id);

        let executable_handle = stream.read_u32()?;
        let module_count = stream.read_u32()?;
        for _ in 0..module_count {
            let module = Arc::new(UserModule::restore(self, stream)?);
            self.objects.reserve_handle(module.handle());
            self.objects.register(module.clone());
            if module.handle() == executable_handle {
                *self.executable_module.write() = Some(Arc::clone(&module));
            }
            self.user_modules.write().push(module);
        }

        let thread_count = stream.read_u32()?;
        let _table = self.thread_table.lock();
        for _ in 0..thread_count {
            let thread = XThread::restore(stream)?;
            self.objects.reserve_handle(thread.handle());
            self.next_thread_id
                .fetch_max(thread.thread_id() + 1, Ordering::Relaxed);
            self.objects.register(thread.clone());
            thread
                .start(Arc::clone(&self.processor))
                .map_err(|e| SnapshotError::Invalid(e.to_string()))?;
        }
        debug!(
            "Restored kernel state: {} modules, {} threads",
            module_count, thread_count
        );
        Ok(())
    }
}
