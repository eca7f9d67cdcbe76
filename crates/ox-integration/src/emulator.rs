//! Main emulator controller that integrates all subsystems
//!
//! The [`Emulator`] owns subsystem bring-up order, the title launch
//! pipeline (host path -> mounted device -> resolved module -> running
//! main thread) and the run-state machine:
//!
//! ```text
//! Ready -> Running <-> Paused -> Terminated
//! ```
//!
//! An emulator whose setup failed is never constructed, so there is no
//! observable uninitialized state.

use crate::events::{EmulatorEvent, EventBus, LogMessageSink, MessageSink};
use crate::systems::{AudioSystem, GraphicsSystem, InputSystem, NullAudio, NullGraphics, NullInput};
use ox_core::clock;
use ox_core::{Config, EmulatorError, Result};
use ox_cpu::{Backend, ExportResolver, HostException, NullBackend, Processor};
use ox_kernel::game_info::{GameInfo, XNA_TITLE_FOLDER};
use ox_kernel::{KernelObject, KernelState, UserModule, XThread};
use ox_loader::{NullCrypto, XexCrypto};
use ox_memory::MemoryManager;
use ox_vfs::{
    Device, DiscImageDevice, HostPathDevice, VirtualFileSystem, CDROM_MOUNT_PATH,
    HARDDISK_MOUNT_PATH,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Builds the audio system once the processor exists
pub type AudioFactory = Box<dyn FnOnce(&Arc<Processor>) -> Option<Arc<dyn AudioSystem>> + Send>;

/// Builds the graphics system
pub type GraphicsFactory = Box<dyn FnOnce() -> Option<Arc<dyn GraphicsSystem>> + Send>;

/// Observable run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Set up, no title launched yet
    Ready,
    /// A title is active and not paused
    Running,
    Paused,
    /// The last title was terminated
    Terminated,
}

/// Pluggable pieces handed to [`Emulator::setup`]
pub struct Subsystems {
    pub backend: Arc<dyn Backend>,
    pub crypto: Arc<dyn XexCrypto>,
    /// Audio is optional; when present the factory must produce a system
    pub audio: Option<AudioFactory>,
    pub graphics: GraphicsFactory,
    pub input: Arc<dyn InputSystem>,
    pub message_sink: Arc<dyn MessageSink>,
    /// Reports whether a native debugger is attached to the process
    pub host_debugger: fn() -> bool,
}

impl Subsystems {
    /// Null implementations of every subsystem
    pub fn null() -> Self {
        Self {
            backend: Arc::new(NullBackend::new()),
            crypto: Arc::new(NullCrypto),
            audio: Some(Box::new(|_| Some(Arc::new(NullAudio::new()) as Arc<dyn AudioSystem>))),
            graphics: Box::new(|| Some(Arc::new(NullGraphics::new()) as Arc<dyn GraphicsSystem>)),
            input: Arc::new(NullInput),
            message_sink: Arc::new(LogMessageSink),
            host_debugger: ox_core::debugging::is_debugger_attached,
        }
    }
}

/// Identity of the running title
#[derive(Debug, Default)]
struct TitleInfo {
    title_id: Option<u32>,
    name: String,
    version: String,
}

/// Main emulator controller
pub struct Emulator {
    config: RwLock<Config>,
    /// Directory holding per-title configuration overrides
    config_dir: PathBuf,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) processor: Arc<Processor>,
    pub(crate) audio: Option<Arc<dyn AudioSystem>>,
    pub(crate) graphics: Arc<dyn GraphicsSystem>,
    input: Arc<dyn InputSystem>,
    file_system: Arc<VirtualFileSystem>,
    /// Mount path of the device backing `game:`
    game_mount: Mutex<Option<String>>,
    pub(crate) kernel: Arc<KernelState>,
    events: EventBus,
    message_sink: Arc<dyn MessageSink>,
    host_debugger: fn() -> bool,
    title: Mutex<TitleInfo>,
    pub(crate) main_thread: Mutex<Option<Arc<XThread>>>,
    paused: AtomicBool,
    /// Threads suspended by the current pause, released by resume
    pub(crate) paused_threads: Mutex<Vec<Arc<XThread>>>,
    terminated: AtomicBool,
    restoring: AtomicBool,
    restore_fence: Mutex<()>,
    restore_done: Condvar,
    exit_notified: AtomicBool,
}

impl Emulator {
    /// Bring every subsystem up in dependency order.
    ///
    /// The first failing step aborts setup; whatever was already built is
    /// released by normal drop order.
    pub fn setup(config: Config, config_dir: impl Into<PathBuf>, subsystems: Subsystems) -> Result<Self> {
        info!("Initializing emulator");

        // The console timebase runs at 50 MHz
        clock::setup(
            clock::GUEST_TICK_FREQUENCY,
            clock::query_host_system_time(),
            config.general.time_scalar,
        );

        // Memory first; everything else addresses the guest through it
        let memory = MemoryManager::new();

        // Shared by the loader and the kernel modules
        let export_resolver = Arc::new(ExportResolver::new());

        let processor = Arc::new(Processor::new(Arc::clone(&memory), export_resolver));
        processor.setup(subsystems.backend)?;

        let audio = match subsystems.audio {
            Some(factory) => Some(factory(&processor).ok_or_else(|| {
                EmulatorError::SetupFailed("audio system is not implemented".into())
            })?),
            None => {
                info!("Audio disabled");
                None
            }
        };

        let graphics = (subsystems.graphics)().ok_or_else(|| {
            EmulatorError::SetupFailed("graphics system is not implemented".into())
        })?;

        let input = subsystems.input;
        input.setup()?;

        let file_system = Arc::new(VirtualFileSystem::new());

        let kernel = Arc::new(KernelState::new(
            Arc::clone(&memory),
            Arc::clone(&processor),
            Arc::clone(&file_system),
            config.paths.content_root.clone(),
            subsystems.crypto,
        ));
        kernel.set_apply_patches(config.general.apply_patches);

        graphics.setup(&processor, &kernel)?;
        if let Some(audio) = &audio {
            audio.setup(&kernel)?;
        }

        kernel.register_kernel_modules()?;

        info!(
            "Emulator ready (graphics: {}, audio: {}, input: {})",
            graphics.name(),
            audio.as_ref().map(|a| a.name()).unwrap_or("none"),
            input.name()
        );

        Ok(Self {
            config: RwLock::new(config),
            config_dir: config_dir.into(),
            memory,
            processor,
            audio,
            graphics,
            input,
            file_system,
            game_mount: Mutex::new(None),
            kernel,
            events: EventBus::new(),
            message_sink: subsystems.message_sink,
            host_debugger: subsystems.host_debugger,
            title: Mutex::new(TitleInfo::default()),
            main_thread: Mutex::new(None),
            paused: AtomicBool::new(false),
            paused_threads: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            restoring: AtomicBool::new(false),
            restore_fence: Mutex::new(()),
            restore_done: Condvar::new(),
            exit_notified: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn file_system(&self) -> &Arc<VirtualFileSystem> {
        &self.file_system
    }

    pub fn kernel_state(&self) -> &Arc<KernelState> {
        &self.kernel
    }

    pub fn input_system(&self) -> &Arc<dyn InputSystem> {
        &self.input
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn title_id(&self) -> Option<u32> {
        self.title.lock().title_id
    }

    pub fn title_name(&self) -> String {
        self.title.lock().name.clone()
    }

    pub fn title_version(&self) -> String {
        self.title.lock().version.clone()
    }

    pub fn is_title_open(&self) -> bool {
        self.title_id().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring.load(Ordering::SeqCst)
    }

    pub fn main_thread(&self) -> Option<Arc<XThread>> {
        self.main_thread.lock().clone()
    }

    pub fn run_state(&self) -> RunState {
        if self.is_paused() {
            RunState::Paused
        } else if self.is_title_open() {
            RunState::Running
        } else if self.terminated.load(Ordering::SeqCst) {
            RunState::Terminated
        } else {
            RunState::Ready
        }
    }

    /// Launch a title from a host path. The kind of launch is guessed from
    /// the extension: none means a package container, `.xex`, `.elf` and
    /// `.exe` are naked executables, anything else is a disc image.
    pub fn launch_path(&self, path: &Path) -> Result<()> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            None => self.launch_stfs_container(path),
            Some("xex" | "elf" | "exe") => self.launch_xex_file(path),
            Some(_) => self.launch_disc_image(path),
        }
    }

    /// Launch a naked executable. Its host directory becomes `game:`, so
    /// `/my/files/foo.xex` runs as `game:\foo.xex`.
    pub fn launch_xex_file(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| EmulatorError::LaunchFailed(format!("{} names no file", path.display())))?;

        let device = HostPathDevice::new(HARDDISK_MOUNT_PATH, parent, true).map_err(|e| {
            error!("Unable to scan host path {}: {}", parent.display(), e);
            e
        })?;
        self.mount_game_device(Arc::new(device))?;

        self.complete_launch(&format!("game:\\{}", file_name))
    }

    /// Launch from a GDF disc image
    pub fn launch_disc_image(&self, path: &Path) -> Result<()> {
        let device = DiscImageDevice::open(CDROM_MOUNT_PATH, path).map_err(|e| {
            error!("Unable to mount disc image {}: {}", path.display(), e);
            e
        })?;
        self.mount_game_device(Arc::new(device))?;

        let module_path = self.find_launch_module();
        self.complete_launch(&module_path)
    }

    /// Launch from a package container. Only containers already extracted
    /// to a folder can be mounted.
    pub fn launch_stfs_container(&self, path: &Path) -> Result<()> {
        if path.is_file() {
            return Err(EmulatorError::Unsupported(format!(
                "STFS container {} must be extracted to a folder",
                path.display()
            )));
        }
        let device = HostPathDevice::new(CDROM_MOUNT_PATH, path, true).map_err(|e| {
            error!("Unable to mount package container {}: {}", path.display(), e);
            e
        })?;
        self.mount_game_device(Arc::new(device))?;

        let module_path = self.find_launch_module();
        self.complete_launch(&module_path)
    }

    /// Register `device` in place of the previous game device and point
    /// `game:` and `d:` at it
    fn mount_game_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let mount_path = device.mount_path().to_string();
        let mut game_mount = self.game_mount.lock();
        if let Some(previous) = game_mount.take() {
            if self.file_system.unregister_device(&previous) {
                debug!("Unmounted game device at {}", previous);
            }
        }
        if self.file_system.unregister_device(&mount_path) {
            debug!("Replacing device at {}", mount_path);
        }
        self.file_system.register_device(device)?;
        self.file_system.register_symbolic_link("game:", &mount_path);
        self.file_system.register_symbolic_link("d:", &mount_path);
        *game_mount = Some(mount_path);
        Ok(())
    }

    /// Guest path of the module to run from a mounted disc or package
    pub fn find_launch_module(&self) -> String {
        let launch_module = self.config.read().general.launch_module.clone();
        if !launch_module.is_empty() {
            return format!("game:\\{}", launch_module);
        }

        let mut default_module = String::from("default.xex");
        if let Ok(data) = self.file_system.read_file("game:\\GameInfo.bin") {
            let info = GameInfo::parse(&data);
            if info.is_valid() {
                info!("Found virtual title {}", info.virtual_title_id());
                if self
                    .file_system
                    .exists(&format!("game:\\{}", XNA_TITLE_FOLDER))
                {
                    default_module = format!("{}\\{}", XNA_TITLE_FOLDER, info.module_name());
                } else {
                    error!("Could not find fixed XNA path {}", XNA_TITLE_FOLDER);
                }
            }
        }
        format!("game:\\{}", default_module)
    }

    /// Load `module_path`, start its main thread and announce the title
    fn complete_launch(&self, module_path: &str) -> Result<()> {
        *self.title.lock() = TitleInfo::default();

        info!("Launching module {}", module_path);
        let module = self.kernel.load_user_module(module_path).map_err(|e| {
            error!("Failed to load user module {}: {}", module_path, e);
            EmulatorError::ModuleNotFound(format!("{}: {}", module_path, e))
        })?;

        let (title_id, version) = match module.execution_info() {
            Some(info) => (info.title_id, info.version),
            None => (0, Default::default()),
        };

        // Blocking, so the first frames are not lost while the cache loads
        let cache_root = self.config.read().paths.cache_root.clone();
        self.events
            .publish(EmulatorEvent::ShaderStorageInitialization(true));
        let shaders = self
            .graphics
            .initialize_shader_storage(&cache_root, title_id, true);
        self.events
            .publish(EmulatorEvent::ShaderStorageInitialization(false));
        shaders?;

        let main_thread = self.kernel.launch_module(&module).map_err(|e| {
            error!("Failed to launch {}: {}", module.name(), e);
            EmulatorError::LaunchFailed(e.to_string())
        })?;

        let title_name = if title_id != 0 {
            self.load_title_config(title_id);
            display_name(&module)
        } else {
            String::new()
        };
        // The title only counts as open once its main thread exists
        {
            let mut title = self.title.lock();
            title.title_id = Some(title_id);
            if version.0 != 0 {
                title.version = version.to_string();
            }
            title.name = title_name.clone();
        }

        *self.main_thread.lock() = Some(main_thread);
        self.terminated.store(false, Ordering::SeqCst);
        self.exit_notified.store(false, Ordering::SeqCst);

        info!(
            "Title {:08X} {} launched{}",
            title_id,
            title_name,
            match self.title_version().as_str() {
                "" => String::new(),
                v => format!(" (v{})", v),
            }
        );
        self.events.publish(EmulatorEvent::Launched {
            title_id,
            title_name,
        });
        Ok(())
    }

    /// Apply `games/<TITLEID>.toml` overrides
    fn load_title_config(&self, title_id: u32) {
        let mut config = self.config.write();
        match config.load_title_config(&self.config_dir, &format!("{:08X}", title_id)) {
            Ok(true) => {
                self.kernel.set_apply_patches(config.general.apply_patches);
                clock::set_time_scalar(config.general.time_scalar);
            }
            Ok(false) => {}
            Err(e) => warn!("Ignoring configuration for {:08X}: {}", title_id, e),
        }
    }

    /// Stop every guest thread except the calling one and host threads,
    /// returning once each has parked with its context saved. Does nothing
    /// when already paused.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }

        // Don't hold the thread table here, so subsystem waits can finish
        self.graphics.pause();
        if let Some(audio) = &self.audio {
            audio.pause();
        }
        self.processor.pause();

        let suspended = self.kernel.with_thread_table(|threads| {
            threads
                .iter()
                .filter(|t| !t.is_current() && t.can_debugger_suspend() && t.is_running())
                .map(|t| {
                    t.suspend();
                    Arc::clone(t)
                })
                .collect::<Vec<_>>()
        });
        // Outside the table so parking threads can still reach it
        for thread in &suspended {
            thread.wait_until_parked();
        }
        debug!("! EMULATOR PAUSED ! ({} threads)", suspended.len());
        self.paused_threads.lock().extend(suspended);
    }

    /// Release what [`Self::pause`] suspended. Does nothing unless paused.
    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("! EMULATOR RESUMED !");

        self.graphics.resume();
        if let Some(audio) = &self.audio {
            audio.resume();
        }
        self.processor.resume();

        self.kernel.with_thread_table(|_| {
            for thread in self.paused_threads.lock().drain(..) {
                thread.resume();
            }
        });
    }

    /// Tear down the active title
    pub fn terminate_title(&self) -> Result<()> {
        if !self.is_title_open() {
            return Err(EmulatorError::NoTitle);
        }

        self.kernel.terminate_title();
        *self.title.lock() = TitleInfo::default();
        *self.main_thread.lock() = None;
        self.paused_threads.lock().clear();
        self.terminated.store(true, Ordering::SeqCst);

        self.events.publish(EmulatorEvent::Terminated);
        Ok(())
    }

    /// Whether the running title asked for another title to be launched
    pub fn title_requested(&self) -> bool {
        self.kernel.has_title_request()
    }

    /// Launch the title requested by the running one
    pub fn launch_next_title(&self) -> Result<()> {
        let request = self
            .kernel
            .take_title_request()
            .ok_or_else(|| EmulatorError::LaunchFailed("no title was requested".into()))?;
        self.complete_launch(&request.path)
    }

    /// Route a host-trapped fault. Returns whether it was handled.
    ///
    /// Faults outside the code cache belong to the host and are declined.
    /// A guest fault pauses the machine, dumps the faulting thread and
    /// parks it for good.
    pub fn handle_exception(&self, ex: &HostException) -> bool {
        if !self.processor.is_debugger_attached() && (self.host_debugger)() {
            // Another debugger is attached; let it see the fault
            return false;
        } else if self.processor.is_debugger_attached() {
            // It may continue past the fault (stepping breakpoints etc)
            return self.processor.on_unhandled_exception(ex);
        }

        let Some(backend) = self.processor.backend() else {
            return false;
        };
        if !backend.code_cache_contains(ex.pc) {
            return false;
        }

        self.pause();

        let current = XThread::current();
        let guest_pc = backend
            .lookup_function(ex.pc)
            .map(|function| function.map_host_to_guest(ex.pc));

        error!("==== CRASH DUMP ====");
        if let Some(thread) = &current {
            error!("Thread ID (Guest: 0x{:08X})", thread.thread_id());
            error!("Thread Handle: 0x{:08X}", thread.handle());
        }
        match guest_pc {
            Some(pc) => error!("PC: 0x{:08X}", pc),
            None => error!("PC: unknown (host 0x{:016X})", ex.pc),
        }
        error!("Fault: {:?}", ex.code);
        if let Some(thread) = &current {
            error!("Registers:");
            for line in thread.context().dump_lines() {
                error!("{}", line);
            }
        }

        self.events.publish(EmulatorEvent::GuestCrashed {
            thread_handle: current.as_ref().map(|t| t.handle()),
            guest_pc,
        });
        self.message_sink.show_message(
            "Uh-oh!",
            "The guest has crashed.\n\n\
             The emulator has now paused itself.\n\
             A crash dump has been written into the log.",
        );

        // The faulting thread never continues
        if let Some(thread) = current {
            thread.suspend();
            thread.wait_while_suspended();
        }
        true
    }

    /// Block until the main guest thread exits. A restore in progress
    /// swaps the main thread, so the wait starts over once it completes.
    pub fn wait_until_exit(&self) {
        loop {
            let main_thread = self.main_thread();
            if let Some(thread) = main_thread {
                thread.wait_exit();
            }

            let mut fence = self.restore_fence.lock();
            if !self.restoring.load(Ordering::SeqCst) {
                break;
            }
            while self.restoring.load(Ordering::SeqCst) {
                self.restore_done.wait(&mut fence);
            }
        }

        if !self.exit_notified.swap(true, Ordering::SeqCst) {
            info!("Main thread exited");
            self.events.publish(EmulatorEvent::Exited);
        }
    }

    pub(crate) fn begin_restore(&self) {
        let _fence = self.restore_fence.lock();
        self.restoring.store(true, Ordering::SeqCst);
    }

    pub(crate) fn end_restore(&self) {
        let _fence = self.restore_fence.lock();
        self.restoring.store(false, Ordering::SeqCst);
        self.restore_done.notify_all();
    }
}

/// Name shown for a title: the executable's file stem
fn display_name(module: &UserModule) -> String {
    Path::new(module.name())
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Drop for Emulator {
    fn drop(&mut self) {
        if self.is_title_open() {
            if let Err(e) = self.terminate_title() {
                warn!("Failed to terminate title on shutdown: {}", e);
            }
        }
        // Give the systems time to shut down before they are released
        self.graphics.shutdown();
        if let Some(audio) = &self.audio {
            audio.shutdown();
        }
    }
}
