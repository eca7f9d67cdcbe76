//! Whole-machine snapshots
//!
//! Layout: marker, title binding, then one blob per subsystem in a fixed
//! order (processor, graphics, audio when present, kernel, memory). All
//! values are big-endian and the title id is only present when a title is
//! bound. Modules come back at their saved addresses; the memory blob that
//! follows the kernel blob supplies their images and loader records.

use crate::emulator::Emulator;
use ox_core::error::SnapshotError;
use ox_core::{ByteReader, ByteWriter, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::{error, info};

/// First word of every snapshot file ('XSAV')
pub const SNAPSHOT_MARKER: u32 = 0x5853_4156;

/// Largest snapshot the writer will produce
pub const SNAPSHOT_CAPACITY: u64 = 2 * 1024 * 1024 * 1024;

/// Tag a subsystem failure with what was being done to which subsystem
fn step(
    action: &'static str,
    subsystem: &'static str,
    result: std::result::Result<(), SnapshotError>,
) -> std::result::Result<(), SnapshotError> {
    result.map_err(|e| {
        error!("Could not {} {}: {}", action, subsystem, e);
        SnapshotError::Subsystem { action, subsystem }
    })
}

impl Emulator {
    /// Pause the machine, write every subsystem to `path` and resume.
    /// A failed save may leave a partial file behind.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.pause();
        let result = self.write_snapshot(path);
        self.resume();

        match &result {
            Ok(()) => info!("Saved snapshot to {}", path.display()),
            Err(e) => error!("Failed to save snapshot to {}: {}", path.display(), e),
        }
        result
    }

    fn write_snapshot(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        let mut stream = ByteWriter::with_capacity_limit(SNAPSHOT_CAPACITY);

        stream.write_u32(SNAPSHOT_MARKER)?;
        let title_id = self.title_id();
        stream.write_bool(title_id.is_some())?;
        if let Some(title_id) = title_id {
            stream.write_u32(title_id)?;
        }

        step("save", "processor", self.processor.save(&mut stream))?;
        step("save", "graphics", self.graphics.save(&mut stream))?;
        if let Some(audio) = &self.audio {
            step("save", "audio", audio.save(&mut stream))?;
        }
        step("save", "kernel", self.kernel.save(&mut stream))?;
        step("save", "memory", self.memory.save(&mut stream))?;

        // Only the written prefix lands on disk
        file.write_all(stream.as_slice())?;
        file.sync_all()?;
        Ok(())
    }

    /// Replace the running machine with the one saved in `path`.
    ///
    /// The marker and title binding are checked before anything is torn
    /// down. Past that point a failing subsystem leaves the machine
    /// partially restored and paused.
    pub fn restore_from_file(&self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let mut stream = ByteReader::new(&data);

        let marker = stream.read_u32()?;
        if marker != SNAPSHOT_MARKER {
            return Err(SnapshotError::BadMarker(marker).into());
        }
        let saved_title = match stream.read_bool()? {
            true => Some(stream.read_u32()?),
            false => None,
        };
        let current_title = self.title_id();
        if saved_title != current_title {
            return Err(SnapshotError::TitleMismatch {
                expected: current_title,
                found: saved_title,
            }
            .into());
        }

        self.begin_restore();
        self.pause();
        self.kernel.terminate_title();

        let result = self.restore_subsystems(&mut stream);
        if result.is_ok() {
            *self.main_thread.lock() = self.kernel.main_thread();
            // Restored threads come back suspended once
            *self.paused_threads.lock() = self.kernel.threads();
            self.resume();
            info!("Restored snapshot from {}", path.display());
        } else {
            error!("Restore from {} failed; machine left paused", path.display());
        }

        self.end_restore();
        result
    }

    fn restore_subsystems(&self, stream: &mut ByteReader) -> Result<()> {
        step("restore", "processor", self.processor.restore(stream))?;
        step("restore", "graphics", self.graphics.restore(stream))?;
        if let Some(audio) = &self.audio {
            step("restore", "audio", audio.restore(stream))?;
        }
        step("restore", "kernel", self.kernel.restore(stream))?;
        step("restore", "memory", self.memory.restore(stream))?;
        Ok(())
    }
}
