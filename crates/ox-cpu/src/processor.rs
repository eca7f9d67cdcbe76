//! Processor: owns the backend and the set of loaded guest modules

use crate::backend::{Backend, ExecutionHooks};
use crate::context::ThreadContext;
use crate::exception::HostException;
use crate::export_resolver::ExportResolver;
use ox_core::error::SnapshotError;
use ox_core::{ByteReader, ByteWriter, EmulatorError};
use ox_memory::MemoryManager;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Snapshot marker for the processor blob ('PROC')
pub const PROCESSOR_SNAPSHOT_MAGIC: u32 = 0x5052_4F43;

/// Guest address range occupied by a loaded module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRange {
    pub name: String,
    pub low_address: u32,
    pub high_address: u32,
}

impl ModuleRange {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.low_address && address < self.high_address
    }
}

/// In-emulator debugger
pub trait Debugger: Send + Sync {
    /// Handle a fault. Returning true resumes past it.
    fn on_unhandled_exception(&self, ex: &HostException) -> bool;
}

/// Guest processor facade
pub struct Processor {
    memory: Arc<MemoryManager>,
    export_resolver: Arc<ExportResolver>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    modules: RwLock<Vec<ModuleRange>>,
    debugger: RwLock<Option<Arc<dyn Debugger>>>,
    paused: AtomicBool,
}

impl Processor {
    pub fn new(memory: Arc<MemoryManager>, export_resolver: Arc<ExportResolver>) -> Self {
        Self {
            memory,
            export_resolver,
            backend: RwLock::new(None),
            modules: RwLock::new(Vec::new()),
            debugger: RwLock::new(None),
            paused: AtomicBool::new(false),
        }
    }

    /// Install and initialize the translation backend
    pub fn setup(&self, backend: Arc<dyn Backend>) -> ox_core::Result<()> {
        if !backend.initialize() {
            return Err(EmulatorError::SetupFailed(format!(
                "{} processor backend failed to initialize",
                backend.name()
            )));
        }
        tracing::info!("Processor using {} backend", backend.name());
        *self.backend.write() = Some(backend);
        Ok(())
    }

    pub fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.read().clone()
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn export_resolver(&self) -> &Arc<ExportResolver> {
        &self.export_resolver
    }

    pub fn add_module(&self, module: ModuleRange) {
        tracing::debug!(
            "Processor module {} at 0x{:08X}-0x{:08X}",
            module.name,
            module.low_address,
            module.high_address
        );
        self.modules.write().push(module);
    }

    pub fn remove_module(&self, name: &str) -> bool {
        let mut modules = self.modules.write();
        let before = modules.len();
        modules.retain(|m| m.name != name);
        modules.len() != before
    }

    /// Module whose range contains a guest address
    pub fn lookup_module(&self, address: u32) -> Option<ModuleRange> {
        self.modules
            .read()
            .iter()
            .find(|m| m.contains(address))
            .cloned()
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().iter().map(|m| m.name.clone()).collect()
    }

    pub fn attach_debugger(&self, debugger: Arc<dyn Debugger>) {
        *self.debugger.write() = Some(debugger);
    }

    pub fn detach_debugger(&self) {
        *self.debugger.write() = None;
    }

    /// Whether the in-emulator debugger is attached
    pub fn is_debugger_attached(&self) -> bool {
        self.debugger.read().is_some()
    }

    /// Forward a fault to the in-emulator debugger
    pub fn on_unhandled_exception(&self, ex: &HostException) -> bool {
        let debugger = self.debugger.read().clone();
        debugger.is_some_and(|d| d.on_unhandled_exception(ex))
    }

    /// Run guest code on the calling thread until the hooks stop it
    pub fn execute(
        &self,
        ctx: &mut ThreadContext,
        entry: u32,
        hooks: &dyn ExecutionHooks,
    ) -> ox_core::Result<()> {
        let backend = self.backend().ok_or(EmulatorError::NotInitialized)?;
        backend.execute(ctx, entry, hooks);
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(PROCESSOR_SNAPSHOT_MAGIC)?;
        let modules = self.modules.read();
        stream.write_u32(modules.len() as u32)?;
        for module in modules.iter() {
            stream.write_string(&module.name)?;
            stream.write_u32(module.low_address)?;
            stream.write_u32(module.high_address)?;
        }
        Ok(())
    }

    pub fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError> {
        let magic = stream.read_u32()?;
        if magic != PROCESSOR_SNAPSHOT_MAGIC {
            return Err(SnapshotError::Invalid(format!(
                "processor blob marker 0x{:08x}",
                magic
            )));
        }
        let count = stream.read_u32()?;
        let mut modules = Vec::with_capacity(count as usize);
        for _ in 0..count {
            modules.push(ModuleRange {
                name: stream.read_string()?,
                low_address: stream.read_u32()?,
                high_address: stream.read_u32()?,
            });
        }
        *self.modules.write() = modules;
        Ok(())
    }
}
