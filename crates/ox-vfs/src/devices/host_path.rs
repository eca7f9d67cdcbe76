//! Host directory device
//!
//! Maps a directory on the host into the guest namespace. Guest lookups
//! are case-insensitive, host file systems may not be, so each component
//! is matched against the directory listing when an exact hit fails.

use crate::device::{Device, Entry};
use ox_core::error::VfsError;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct HostPathDevice {
    mount_path: String,
    host_root: PathBuf,
    read_only: bool,
}

impl HostPathDevice {
    /// Create a device over `host_root`, which must be an existing directory
    pub fn new(
        mount_path: &str,
        host_root: impl Into<PathBuf>,
        read_only: bool,
    ) -> Result<Self, VfsError> {
        let host_root = host_root.into();
        if !host_root.is_dir() {
            return Err(VfsError::DeviceInit(format!(
                "{} is not a directory",
                host_root.display()
            )));
        }
        debug!(
            "Host path device {} -> {} ({})",
            mount_path,
            host_root.display(),
            if read_only { "ro" } else { "rw" }
        );
        Ok(Self {
            mount_path: mount_path.to_string(),
            host_root,
            read_only,
        })
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    fn find_component(dir: &Path, name: &str) -> Option<PathBuf> {
        let exact = dir.join(name);
        if exact.exists() {
            return Some(exact);
        }
        std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
            .map(|e| e.path())
    }

    fn host_file(&self, path: &str) -> Option<PathBuf> {
        let mut current = self.host_root.clone();
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            if component == "." {
                continue;
            }
            if component == ".." {
                return None;
            }
            current = Self::find_component(&current, component)?;
        }
        Some(current)
    }

    fn make_entry(relative: String, host: &Path) -> Option<Entry> {
        let metadata = std::fs::metadata(host).ok()?;
        let name = match relative.rsplit('\\').next() {
            Some(last) if !last.is_empty() => last.to_string(),
            _ => String::new(),
        };
        Some(Entry {
            name,
            path: relative,
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
        })
    }
}

impl Device for HostPathDevice {
    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn resolve(&self, path: &str) -> Option<Entry> {
        let host = self.host_file(path)?;
        // Store the on-disk spelling
        let relative = host
            .strip_prefix(&self.host_root)
            .ok()?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\\");
        Self::make_entry(relative, &host)
    }

    fn read(&self, entry: &Entry) -> Result<Vec<u8>, VfsError> {
        let host = self
            .host_file(&entry.path)
            .ok_or_else(|| VfsError::NotFound(entry.path.clone()))?;
        Ok(std::fs::read(host)?)
    }

    fn list(&self, entry: &Entry) -> Result<Vec<Entry>, VfsError> {
        let host = self
            .host_file(&entry.path)
            .ok_or_else(|| VfsError::NotFound(entry.path.clone()))?;
        let mut children = Vec::new();
        for item in std::fs::read_dir(&host)? {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            let relative = if entry.path.is_empty() {
                name
            } else {
                format!("{}\\{}", entry.path, name)
            };
            if let Some(child) = Self::make_entry(relative, &item.path()) {
                children.push(child);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn host_path(&self, entry: &Entry) -> Option<PathBuf> {
        self.host_file(&entry.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Media")).unwrap();
        std::fs::write(dir.path().join("Media").join("Intro.bik"), b"bink").unwrap();

        let device = HostPathDevice::new("\\Device\\Test", dir.path(), true).unwrap();
        let entry = device.resolve("media\\INTRO.BIK").unwrap();
        assert_eq!(entry.name, "Intro.bik");
        assert_eq!(entry.path, "Media\\Intro.bik");
        assert_eq!(entry.size, 4);
        assert_eq!(device.read(&entry).unwrap(), b"bink");

        let root = device.resolve("").unwrap();
        assert!(root.is_directory);
        let children = device.list(&root).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_directory);
    }

    #[test]
    fn test_missing_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            HostPathDevice::new("\\Device\\Test", dir.path().join("nope"), true),
            Err(VfsError::DeviceInit(_))
        ));
    }

    #[test]
    fn test_parent_components_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let device = HostPathDevice::new("\\Device\\Test", dir.path(), true).unwrap();
        assert!(device.resolve("..\\etc").is_none());
    }
}
