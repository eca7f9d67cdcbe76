//! Graphics, audio and input contracts
//!
//! The emulator core only needs these subsystems to set up, pause, resume,
//! and take part in machine snapshots. The null implementations render,
//! play and read nothing.

use ox_core::error::SnapshotError;
use ox_core::{ByteReader, ByteWriter, EmulatorError};
use ox_cpu::Processor;
use ox_kernel::KernelState;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot marker of the null graphics blob ('NGPU')
const NULL_GRAPHICS_MAGIC: u32 = 0x4E47_5055;
/// Snapshot marker of the null audio blob ('NAPU')
const NULL_AUDIO_MAGIC: u32 = 0x4E41_5055;

/// GPU subsystem
pub trait GraphicsSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once every peer subsystem exists
    fn setup(&self, processor: &Arc<Processor>, kernel: &Arc<KernelState>)
        -> Result<(), EmulatorError>;

    /// Prepare the shader cache for a title. With `blocking` set, returns
    /// only once the cache is usable.
    fn initialize_shader_storage(
        &self,
        cache_root: &Path,
        title_id: u32,
        blocking: bool,
    ) -> Result<(), EmulatorError>;

    fn pause(&self);
    fn resume(&self);

    /// Append this subsystem's blob to a machine snapshot
    fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError>;

    /// Consume exactly the blob written by [`Self::save`]
    fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError>;

    fn shutdown(&self);
}

/// APU subsystem
pub trait AudioSystem: Send + Sync {
    fn name(&self) -> &'static str;
    fn setup(&self, kernel: &Arc<KernelState>) -> Result<(), EmulatorError>;
    fn pause(&self);
    fn resume(&self);
    fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError>;
    fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError>;
    fn shutdown(&self);
}

/// HID subsystem
pub trait InputSystem: Send + Sync {
    fn name(&self) -> &'static str;
    fn setup(&self) -> Result<(), EmulatorError>;
}

/// Graphics system that draws nothing
#[derive(Default)]
pub struct NullGraphics {
    paused: AtomicBool,
    shut_down: AtomicBool,
    shader_storage: Mutex<Option<(PathBuf, u32)>>,
}

impl NullGraphics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Title whose shader storage was initialized last
    pub fn shader_storage_title(&self) -> Option<u32> {
        self.shader_storage.lock().as_ref().map(|(_, title)| *title)
    }
}

impl GraphicsSystem for NullGraphics {
    fn name(&self) -> &'static str {
        "null"
    }

    fn setup(
        &self,
        _processor: &Arc<Processor>,
        _kernel: &Arc<KernelState>,
    ) -> Result<(), EmulatorError> {
        info!("Graphics using null backend");
        Ok(())
    }

    fn initialize_shader_storage(
        &self,
        cache_root: &Path,
        title_id: u32,
        _blocking: bool,
    ) -> Result<(), EmulatorError> {
        let dir = cache_root.join("shaders").join(format!("{:08X}", title_id));
        std::fs::create_dir_all(&dir)?;
        debug!("Shader storage for {:08X} at {}", title_id, dir.display());
        *self.shader_storage.lock() = Some((dir, title_id));
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(NULL_GRAPHICS_MAGIC)?;
        let title = self.shader_storage_title();
        stream.write_bool(title.is_some())?;
        stream.write_u32(title.unwrap_or(0))
    }

    fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError> {
        let magic = stream.read_u32()?;
        if magic != NULL_GRAPHICS_MAGIC {
            return Err(SnapshotError::Invalid(format!(
                "graphics blob marker 0x{:08x}",
                magic
            )));
        }
        // The cache directory is recreated on the next launch
        let _has_title = stream.read_bool()?;
        let _title_id = stream.read_u32()?;
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Audio system that plays nothing
#[derive(Default)]
pub struct NullAudio {
    paused: AtomicBool,
    shut_down: AtomicBool,
}

impl NullAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl AudioSystem for NullAudio {
    fn name(&self) -> &'static str {
        "null"
    }

    fn setup(&self, _kernel: &Arc<KernelState>) -> Result<(), EmulatorError> {
        info!("Audio using null backend");
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn save(&self, stream: &mut ByteWriter) -> Result<(), SnapshotError> {
        stream.write_u32(NULL_AUDIO_MAGIC)
    }

    fn restore(&self, stream: &mut ByteReader) -> Result<(), SnapshotError> {
        let magic = stream.read_u32()?;
        if magic != NULL_AUDIO_MAGIC {
            return Err(SnapshotError::Invalid(format!(
                "audio blob marker 0x{:08x}",
                magic
            )));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Input system with no controllers attached
pub struct NullInput;

impl InputSystem for NullInput {
    fn name(&self) -> &'static str {
        "null"
    }

    fn setup(&self) -> Result<(), EmulatorError> {
        debug!("Input has no drivers");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_graphics_blob() {
        let graphics = NullGraphics::new();
        let dir = tempfile::tempdir().unwrap();
        graphics
            .initialize_shader_storage(dir.path(), 0x4D53_07E6, true)
            .unwrap();
        assert!(dir.path().join("shaders").join("4D5307E6").is_dir());

        let mut writer = ByteWriter::with_capacity_limit(64);
        graphics.save(&mut writer).unwrap();
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        NullGraphics::new().restore(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);

        assert!(NullAudio::new().restore(&mut ByteReader::new(&bytes)).is_err());
    }
}
