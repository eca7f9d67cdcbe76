//! Launch pipeline, run state, crash routing and snapshots

use crossbeam::channel::Receiver;
use ox_core::error::SnapshotError;
use ox_core::{Config, EmulatorError};
use ox_cpu::backend::NULL_CODE_CACHE_BASE;
use ox_cpu::processor::PROCESSOR_SNAPSHOT_MAGIC;
use ox_cpu::{Debugger, ExceptionCode, GuestFunction, HostException, NullBackend};
use ox_integration::{
    Emulator, EmulatorEvent, GraphicsSystem, MessageSink, NullGraphics, RunState, Subsystems,
};
use ox_kernel::game_info::{GameInfo, XNA_TITLE_FOLDER};
use ox_kernel::user_module::ldr_data;
use ox_kernel::KernelObject;
use ox_loader::xex::{ExecutionInfo, XexVersion};
use ox_loader::{ModuleFlags, XexBuilder, XEX2_MAGIC};
use ox_vfs::devices::disc_image::build_test_image;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TITLE_ID: u32 = 0x4D53_07E6;

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<(String, String)>>,
}

impl MessageSink for RecordingSink {
    fn show_message(&self, title: &str, message: &str) {
        self.messages.lock().push((title.to_string(), message.to_string()));
    }
}

struct Fixture {
    emulator: Emulator,
    graphics: Arc<NullGraphics>,
    backend: Arc<NullBackend>,
    sink: Arc<RecordingSink>,
    events: Receiver<EmulatorEvent>,
    games: TempDir,
    config_dir: TempDir,
    _data: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_backend(NullBackend::new(), Config::default())
    }

    fn with_backend(backend: NullBackend, config: Config) -> Self {
        Self::build(backend, config, |_| {})
    }

    fn build(backend: NullBackend, mut config: Config, customize: impl FnOnce(&mut Subsystems)) -> Self {
        let games = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        config.paths.storage_root = data.path().to_path_buf();
        config.paths.content_root = data.path().join("content");
        config.paths.cache_root = data.path().join("cache");

        let graphics = Arc::new(NullGraphics::new());
        let backend = Arc::new(backend);
        let sink = Arc::new(RecordingSink::default());

        let mut subsystems = Subsystems::null();
        subsystems.backend = backend.clone();
        let shared = Arc::clone(&graphics);
        subsystems.graphics = Box::new(move || Some(shared as Arc<dyn GraphicsSystem>));
        subsystems.message_sink = sink.clone();
        customize(&mut subsystems);

        let emulator = Emulator::setup(config, config_dir.path(), subsystems).unwrap();
        let events = emulator.events().subscribe();

        Self {
            emulator,
            graphics,
            backend,
            sink,
            events,
            games,
            config_dir,
            _data: data,
        }
    }

    fn write_game_file(&self, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = self.games.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    fn drain_events(&self) -> Vec<EmulatorEvent> {
        self.events.try_iter().collect()
    }
}

fn title_xex() -> Vec<u8> {
    XexBuilder::new()
        .image(vec![0u8; 0x1000])
        .entry_point(0x8200_0100)
        .stack_size(0x40000)
        .execution_info(ExecutionInfo {
            title_id: TITLE_ID,
            version: XexVersion(0x1002_0003),
            disc_number: 1,
            disc_count: 1,
            ..Default::default()
        })
        .build()
}

/// Debugger that records faults and answers with a fixed verdict
struct RecordingDebugger {
    resume: bool,
    seen: Mutex<Vec<u64>>,
}

impl Debugger for RecordingDebugger {
    fn on_unhandled_exception(&self, ex: &HostException) -> bool {
        self.seen.lock().push(ex.pc);
        self.resume
    }
}

fn declare_entry_function(backend: &NullBackend) {
    backend.declare_function(GuestFunction {
        name: "sub_82000100".into(),
        guest_address: 0x8200_0100,
        host_start: NULL_CODE_CACHE_BASE + 0x200,
        host_size: 0x40,
        source_map: vec![(0x0, 0x8200_0100), (0x8, 0x8200_0104)],
    });
}

#[test]
fn test_setup_without_graphics_fails() {
    let mut subsystems = Subsystems::null();
    subsystems.graphics = Box::new(|| None);
    let result = Emulator::setup(Config::default(), std::env::temp_dir(), subsystems);
    assert!(matches!(result, Err(EmulatorError::SetupFailed(_))));
}

#[test]
fn test_naked_xex_launch() {
    let fx = Fixture::new();
    assert_eq!(fx.emulator.run_state(), RunState::Ready);
    let path = fx.write_game_file("title.xex", &title_xex());

    fx.emulator.launch_path(&path).unwrap();

    let vfs = fx.emulator.file_system();
    assert_eq!(
        vfs.find_symbolic_link("game:").as_deref(),
        Some("\\Device\\Harddisk0\\Partition0")
    );
    assert_eq!(
        vfs.find_symbolic_link("d:").as_deref(),
        Some("\\Device\\Harddisk0\\Partition0")
    );
    let module = fx.emulator.kernel_state().executable_module().unwrap();
    assert_eq!(module.path(), "\\Device\\Harddisk0\\Partition0\\title.xex");

    assert_eq!(fx.emulator.title_id(), Some(TITLE_ID));
    assert_eq!(fx.emulator.title_name(), "title");
    assert!(!fx.emulator.title_version().is_empty());
    assert_eq!(fx.emulator.run_state(), RunState::Running);
    assert!(fx.emulator.main_thread().unwrap().is_main());
    assert_eq!(fx.graphics.shader_storage_title(), Some(TITLE_ID));

    assert_eq!(
        fx.drain_events(),
        vec![
            EmulatorEvent::ShaderStorageInitialization(true),
            EmulatorEvent::ShaderStorageInitialization(false),
            EmulatorEvent::Launched {
                title_id: TITLE_ID,
                title_name: "title".into(),
            },
        ]
    );

    fx.emulator.terminate_title().unwrap();
    assert_eq!(fx.emulator.run_state(), RunState::Terminated);
    assert_eq!(fx.drain_events(), vec![EmulatorEvent::Terminated]);
}

#[test]
fn test_missing_module_is_reported() {
    let fx = Fixture::new();
    let path = fx.games.path().join("absent.xex");
    let result = fx.emulator.launch_path(&path);
    assert!(matches!(result, Err(EmulatorError::ModuleNotFound(_))));
    assert!(!fx.emulator.is_title_open());
}

#[test]
fn test_disc_image_defaults_to_default_xex() {
    let fx = Fixture::new();
    let xex = title_xex();
    let iso = fx.write_game_file("disc.iso", &build_test_image(&[("default.xex", &xex)]));

    fx.emulator.launch_path(&iso).unwrap();

    assert_eq!(fx.emulator.find_launch_module(), "game:\\default.xex");
    assert_eq!(
        fx.emulator.file_system().find_symbolic_link("game:").as_deref(),
        Some("\\Device\\Cdrom0")
    );
    assert_eq!(
        fx.emulator
            .kernel_state()
            .executable_module()
            .unwrap()
            .path(),
        "\\Device\\Cdrom0\\default.xex"
    );
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_extracted_package_uses_game_info() {
    let fx = Fixture::new();
    fx.write_game_file("package/GameInfo.bin", &GameInfo::build("58410A8C", "Game.xex"));
    fx.write_game_file(&format!("package/{}/Game.xex", XNA_TITLE_FOLDER), &title_xex());

    fx.emulator
        .launch_path(&fx.games.path().join("package"))
        .unwrap();

    assert_eq!(
        fx.emulator.find_launch_module(),
        format!("game:\\{}\\Game.xex", XNA_TITLE_FOLDER)
    );
    assert_eq!(fx.emulator.title_name(), "Game");
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_game_info_without_fixed_folder_falls_back() {
    let fx = Fixture::new();
    fx.write_game_file("package/GameInfo.bin", &GameInfo::build("58410A8C", "Game.xex"));
    fx.write_game_file("package/default.xex", &title_xex());

    fx.emulator
        .launch_path(&fx.games.path().join("package"))
        .unwrap();
    assert_eq!(fx.emulator.find_launch_module(), "game:\\default.xex");
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_launch_module_override() {
    let mut config = Config::default();
    config.general.launch_module = "alt.xex".into();
    let fx = Fixture::with_backend(NullBackend::new(), config);
    fx.write_game_file("package/default.xex", &title_xex());
    fx.write_game_file("package/alt.xex", &title_xex());

    fx.emulator
        .launch_path(&fx.games.path().join("package"))
        .unwrap();
    assert_eq!(
        fx.emulator
            .kernel_state()
            .executable_module()
            .unwrap()
            .path(),
        "\\Device\\Cdrom0\\alt.xex"
    );
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_packed_container_is_unsupported() {
    let fx = Fixture::new();
    let path = fx.write_game_file("CONTAINER", b"LIVE");
    let result = fx.emulator.launch_path(&path);
    assert!(matches!(result, Err(EmulatorError::Unsupported(_))));
}

#[test]
fn test_title_config_is_applied_on_launch() {
    let fx = Fixture::new();
    let games_dir = fx.config_dir.path().join("games");
    std::fs::create_dir_all(&games_dir).unwrap();
    std::fs::write(
        games_dir.join(format!("{:08X}.toml", TITLE_ID)),
        "apply_patches = false\n",
    )
    .unwrap();

    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    assert!(!fx.emulator.config().general.apply_patches);
    assert!(!fx.emulator.kernel_state().apply_patches());
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_terminate_without_title() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.emulator.terminate_title(),
        Err(EmulatorError::NoTitle)
    ));
}

#[test]
fn test_pause_and_resume_are_idempotent() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let main = fx.emulator.main_thread().unwrap();

    fx.emulator.pause();
    fx.emulator.pause();
    assert_eq!(fx.emulator.run_state(), RunState::Paused);
    assert!(fx.graphics.is_paused());
    assert!(fx.emulator.processor().is_paused());
    assert_eq!(main.suspend_count(), 1);

    fx.emulator.resume();
    fx.emulator.resume();
    assert_eq!(fx.emulator.run_state(), RunState::Running);
    assert!(!fx.graphics.is_paused());
    assert_eq!(main.suspend_count(), 0);

    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_snapshot_round_trip() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let main_handle = fx.emulator.main_thread().unwrap().handle();

    let snapshot = fx.games.path().join("state.sav");
    fx.emulator.save_to_file(&snapshot).unwrap();
    assert!(!fx.emulator.is_paused());
    assert_eq!(
        std::fs::read(&snapshot).unwrap()[0..4],
        [0x58, 0x53, 0x41, 0x56]
    );

    fx.emulator.restore_from_file(&snapshot).unwrap();
    assert!(!fx.emulator.is_restoring());
    assert!(!fx.emulator.is_paused());
    assert_eq!(fx.emulator.title_id(), Some(TITLE_ID));
    let main = fx.emulator.main_thread().unwrap();
    assert_eq!(main.handle(), main_handle);
    assert_eq!(main.suspend_count(), 0);

    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_restore_for_another_title_is_refused() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let snapshot = fx.games.path().join("state.sav");
    fx.emulator.save_to_file(&snapshot).unwrap();
    fx.emulator.terminate_title().unwrap();

    let result = fx.emulator.restore_from_file(&snapshot);
    assert!(matches!(
        result,
        Err(EmulatorError::Snapshot(SnapshotError::TitleMismatch {
            expected: None,
            found: Some(TITLE_ID),
        }))
    ));
    // Nothing was torn down or brought back
    assert_eq!(fx.emulator.run_state(), RunState::Terminated);
    assert!(fx.emulator.kernel_state().threads().is_empty());
}

#[test]
fn test_restore_rejects_bad_marker() {
    let fx = Fixture::new();
    let snapshot = fx.games.path().join("junk.sav");
    std::fs::write(&snapshot, [0x00, 0x00, 0x00, 0x01, 0x00]).unwrap();
    assert!(matches!(
        fx.emulator.restore_from_file(&snapshot),
        Err(EmulatorError::Snapshot(SnapshotError::BadMarker(1)))
    ));
}

#[test]
fn test_host_faults_are_declined() {
    let fx = Fixture::new();
    let ex = HostException::new(
        0x1000,
        ExceptionCode::AccessViolation { fault_address: 0 },
    );
    assert!(!fx.emulator.handle_exception(&ex));
    assert!(!fx.emulator.is_paused());
    assert!(fx.sink.messages.lock().is_empty());
}

#[test]
fn test_guest_fault_pauses_and_reports() {
    let fx = Fixture::new();
    fx.backend.declare_function(GuestFunction {
        name: "sub_82000100".into(),
        guest_address: 0x8200_0100,
        host_start: NULL_CODE_CACHE_BASE + 0x200,
        host_size: 0x40,
        source_map: vec![(0x0, 0x8200_0100), (0x8, 0x8200_0104)],
    });
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    fx.drain_events();

    let ex = HostException::new(NULL_CODE_CACHE_BASE + 0x20C, ExceptionCode::IllegalInstruction);
    assert!(fx.emulator.handle_exception(&ex));
    assert!(fx.emulator.is_paused());
    assert_eq!(
        fx.drain_events(),
        vec![EmulatorEvent::GuestCrashed {
            thread_handle: None,
            guest_pc: Some(0x8200_0104),
        }]
    );
    let messages = fx.sink.messages.lock().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "Uh-oh!");

    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_exit_is_announced_once() {
    let fx = Fixture::with_backend(NullBackend::with_step_limit(5), Config::default());
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    fx.drain_events();

    fx.emulator.wait_until_exit();
    fx.emulator.wait_until_exit();
    assert!(fx.emulator.main_thread().unwrap().has_exited());
    assert_eq!(fx.drain_events(), vec![EmulatorEvent::Exited]);
}

#[test]
fn test_requested_title_is_launched() {
    let fx = Fixture::new();
    fx.write_game_file("next.xex", &title_xex());
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    assert!(!fx.emulator.title_requested());
    assert!(matches!(
        fx.emulator.launch_next_title(),
        Err(EmulatorError::LaunchFailed(_))
    ));

    fx.emulator
        .kernel_state()
        .request_title_launch("game:\\next.xex", 0);
    assert!(fx.emulator.title_requested());
    fx.emulator.terminate_title().unwrap();
    fx.emulator.launch_next_title().unwrap();

    assert_eq!(fx.emulator.title_name(), "next");
    assert!(!fx.emulator.title_requested());
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_drop_shuts_systems_down() {
    let fx = Fixture::new();
    let graphics = Arc::clone(&fx.graphics);
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    drop(fx);
    assert!(graphics.is_shut_down());
}

#[test]
fn test_failed_launch_leaves_no_title_open() {
    let fx = Fixture::new();
    let dll = XexBuilder::new()
        .module_flags(ModuleFlags::DLL)
        .image(vec![0u8; 0x1000])
        .entry_point(0x8200_0100)
        .execution_info(ExecutionInfo {
            title_id: TITLE_ID,
            version: XexVersion(0x1002_0003),
            ..Default::default()
        })
        .build();
    let path = fx.write_game_file("library.xex", &dll);

    let result = fx.emulator.launch_path(&path);
    assert!(matches!(result, Err(EmulatorError::LaunchFailed(_))));
    assert!(!fx.emulator.is_title_open());
    assert_eq!(fx.emulator.title_id(), None);
    assert!(fx.emulator.title_version().is_empty());
    assert_eq!(fx.emulator.run_state(), RunState::Ready);
    assert!(fx.emulator.main_thread().is_none());
}

#[test]
fn test_new_launch_unmounts_previous_game_device() {
    let fx = Fixture::new();
    let iso = fx.write_game_file("disc.iso", &build_test_image(&[("default.xex", &title_xex())]));
    fx.emulator.launch_path(&iso).unwrap();
    let vfs = fx.emulator.file_system();
    assert!(vfs.is_device_registered("\\Device\\Cdrom0"));
    fx.emulator.terminate_title().unwrap();

    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    assert!(!vfs.is_device_registered("\\Device\\Cdrom0"));
    assert!(vfs.is_device_registered("\\Device\\Harddisk0\\Partition0"));
    assert_eq!(
        vfs.find_symbolic_link("game:").as_deref(),
        Some("\\Device\\Harddisk0\\Partition0")
    );
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_pause_returns_with_threads_parked() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let main = fx.emulator.main_thread().unwrap();

    fx.emulator.pause();
    assert!(main.is_parked());
    assert_eq!(main.context().pc, 0x8200_0100);

    fx.emulator.resume();
    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_restore_keeps_module_addresses() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let exe = fx.emulator.kernel_state().executable_module().unwrap();
    let (ldr, header) = (exe.ldr_data(), exe.guest_xex_header());

    let snapshot = fx.games.path().join("state.sav");
    fx.emulator.save_to_file(&snapshot).unwrap();
    // Heap use after the save must not leak into the restored machine
    fx.emulator.memory().system_heap_alloc(0x400).unwrap();

    fx.emulator.restore_from_file(&snapshot).unwrap();

    let memory = fx.emulator.memory();
    let restored = fx.emulator.kernel_state().executable_module().unwrap();
    assert_eq!(restored.ldr_data(), ldr);
    assert_eq!(restored.guest_xex_header(), header);
    assert_eq!(memory.read_be32(ldr + ldr_data::ENTRY_POINT).unwrap(), 0x8200_0100);
    assert_eq!(memory.read_be32(ldr + ldr_data::XEX_HEADER_BASE).unwrap(), header);
    assert_eq!(memory.read_be32(header).unwrap(), XEX2_MAGIC);
    assert_eq!(fx.emulator.kernel_state().user_modules().len(), 1);

    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_snapshot_without_title_omits_title_id() {
    let fx = Fixture::new();
    let snapshot = fx.games.path().join("idle.sav");
    fx.emulator.save_to_file(&snapshot).unwrap();

    let data = std::fs::read(&snapshot).unwrap();
    assert_eq!(data[0..4], [0x58, 0x53, 0x41, 0x56]);
    assert_eq!(data[4], 0);
    assert_eq!(data[5..9], PROCESSOR_SNAPSHOT_MAGIC.to_be_bytes());

    fx.emulator.restore_from_file(&snapshot).unwrap();
    assert!(!fx.emulator.is_title_open());
    assert!(!fx.emulator.is_paused());
}

#[test]
fn test_exit_wait_survives_restore() {
    let fx = Fixture::new();
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    let snapshot = fx.games.path().join("state.sav");
    fx.emulator.save_to_file(&snapshot).unwrap();
    fx.drain_events();

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| fx.emulator.wait_until_exit());
        std::thread::sleep(Duration::from_millis(20));

        // The old main thread exits during the restore; the wait carries on
        fx.emulator.restore_from_file(&snapshot).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        fx.emulator.terminate_title().unwrap();
        waiter.join().unwrap();
    });

    let exits = fx
        .drain_events()
        .into_iter()
        .filter(|event| *event == EmulatorEvent::Exited)
        .count();
    assert_eq!(exits, 1);
}

#[test]
fn test_attached_debugger_receives_faults() {
    let fx = Fixture::new();
    declare_entry_function(&fx.backend);
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    fx.drain_events();

    let debugger = Arc::new(RecordingDebugger {
        resume: true,
        seen: Mutex::new(Vec::new()),
    });
    fx.emulator.processor().attach_debugger(debugger.clone());

    let ex = HostException::new(NULL_CODE_CACHE_BASE + 0x20C, ExceptionCode::IllegalInstruction);
    assert!(fx.emulator.handle_exception(&ex));
    assert_eq!(*debugger.seen.lock(), vec![NULL_CODE_CACHE_BASE + 0x20C]);
    assert!(!fx.emulator.is_paused());
    assert!(fx.sink.messages.lock().is_empty());
    assert!(fx.drain_events().is_empty());

    fx.emulator.processor().attach_debugger(Arc::new(RecordingDebugger {
        resume: false,
        seen: Mutex::new(Vec::new()),
    }));
    assert!(!fx.emulator.handle_exception(&ex));
    assert!(!fx.emulator.is_paused());

    fx.emulator.terminate_title().unwrap();
}

#[test]
fn test_native_debugger_sees_faults_first() {
    let fx = Fixture::build(NullBackend::new(), Config::default(), |subsystems| {
        subsystems.host_debugger = || true;
    });
    declare_entry_function(&fx.backend);
    let path = fx.write_game_file("title.xex", &title_xex());
    fx.emulator.launch_path(&path).unwrap();
    fx.drain_events();

    let ex = HostException::new(NULL_CODE_CACHE_BASE + 0x20C, ExceptionCode::IllegalInstruction);
    assert!(!fx.emulator.handle_exception(&ex));
    assert!(!fx.emulator.is_paused());
    assert!(fx.sink.messages.lock().is_empty());
    assert!(fx.drain_events().is_empty());

    fx.emulator.terminate_title().unwrap();
}
