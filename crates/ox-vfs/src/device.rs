//! Device contract shared by every mounted file source

use ox_core::error::VfsError;
use std::path::PathBuf;
use std::sync::Arc;

/// A file or directory inside a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Final path component, with the case stored on the device
    pub name: String,
    /// Path relative to the device root, `\` separated
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
}

/// A mounted file source
pub trait Device: Send + Sync {
    /// Guest path the device is mounted at, e.g. `\Device\Cdrom0`
    fn mount_path(&self) -> &str;

    fn is_read_only(&self) -> bool;

    /// Look up `path` (relative to the device root, case-insensitive).
    /// An empty path names the root directory.
    fn resolve(&self, path: &str) -> Option<Entry>;

    /// Read the whole contents of a file entry
    fn read(&self, entry: &Entry) -> Result<Vec<u8>, VfsError>;

    /// Children of a directory entry
    fn list(&self, entry: &Entry) -> Result<Vec<Entry>, VfsError>;

    /// Host file backing `entry`, if the device maps host files directly
    fn host_path(&self, _entry: &Entry) -> Option<PathBuf> {
        None
    }
}

/// An entry together with the device that serves it
#[derive(Clone)]
pub struct OpenFile {
    pub device: Arc<dyn Device>,
    pub entry: Entry,
}

impl OpenFile {
    pub fn read_all(&self) -> Result<Vec<u8>, VfsError> {
        if self.entry.is_directory {
            return Err(VfsError::Io(format!("{} is a directory", self.entry.path)));
        }
        self.device.read(&self.entry)
    }

    pub fn list(&self) -> Result<Vec<Entry>, VfsError> {
        self.device.list(&self.entry)
    }

    pub fn host_path(&self) -> Option<PathBuf> {
        self.device.host_path(&self.entry)
    }

    /// Full guest path through the device mount, e.g.
    /// `\Device\Cdrom0\default.xex`
    pub fn absolute_path(&self) -> String {
        if self.entry.path.is_empty() {
            self.device.mount_path().to_string()
        } else {
            format!("{}\\{}", self.device.mount_path(), self.entry.path)
        }
    }
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("device", &self.device.mount_path())
            .field("entry", &self.entry)
            .finish()
    }
}
