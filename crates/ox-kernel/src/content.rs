//! Installed content packages
//!
//! Content for a title lives under
//! `<content_root>/<TITLEID>/<content type>/<package>`. A package is
//! either an extracted folder, optionally accompanied by a
//! `<package>.headers.bin` sidecar holding the STFS header, or a raw STFS
//! file. Opening a package mounts it as a device and binds a root name
//! such as `update:` to it.

use ox_core::error::KernelError;
use ox_vfs::{HostPathDevice, VirtualFileSystem};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Title updates
pub const CONTENT_TYPE_INSTALLER: u32 = 0x000B_0000;
pub const CONTENT_TYPE_SAVED_GAME: u32 = 0x0000_0001;
pub const CONTENT_TYPE_MARKETPLACE: u32 = 0x0000_0002;

pub const HEADERS_EXTENSION: &str = ".headers.bin";

/// Size of a full STFS header; smaller files cannot be packages
pub const STFS_HEADER_SIZE: u64 = 0x971A;
const STFS_CONTENT_TYPE_OFFSET: usize = 0x344;
const STFS_DISPLAY_NAME_OFFSET: usize = 0x411;
const STFS_DISPLAY_NAME_LEN: usize = 0x100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentData {
    pub device_id: u32,
    pub content_type: u32,
    pub display_name: String,
    pub file_name: String,
}

struct OpenPackage {
    root_name: String,
    mount_path: String,
    package_path: PathBuf,
}

pub struct ContentManager {
    root: PathBuf,
    vfs: Arc<VirtualFileSystem>,
    open_packages: Mutex<Vec<OpenPackage>>,
    next_device: AtomicU32,
}

impl ContentManager {
    pub fn new(root: impl Into<PathBuf>, vfs: Arc<VirtualFileSystem>) -> Self {
        Self {
            root: root.into(),
            vfs,
            open_packages: Mutex::new(Vec::new()),
            next_device: AtomicU32::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<TITLEID>/<TYPE>`
    pub fn package_root(&self, title_id: u32, content_type: u32) -> PathBuf {
        self.root
            .join(format!("{:08X}", title_id))
            .join(format!("{:08X}", content_type))
    }

    pub fn package_path(&self, title_id: u32, data: &ContentData) -> PathBuf {
        self.package_root(title_id, data.content_type)
            .join(&data.file_name)
    }

    /// Packages of one type installed for a title, sorted by file name
    pub fn list_content(&self, title_id: u32, content_type: u32) -> Vec<ContentData> {
        let package_root = self.package_root(title_id, content_type);
        let Ok(entries) = std::fs::read_dir(&package_root) else {
            return Vec::new();
        };

        let mut result = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(HEADERS_EXTENSION) {
                continue;
            }
            let path = entry.path();
            let is_directory = path.is_dir();

            let mut data = ContentData {
                device_id: 0,
                content_type,
                display_name: file_name.clone(),
                file_name: file_name.clone(),
            };

            let headers_path = if is_directory {
                package_root.join(format!("{}{}", file_name, HEADERS_EXTENSION))
            } else {
                path.clone()
            };
            if headers_path.exists() {
                if !is_directory {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    if size <= STFS_HEADER_SIZE {
                        continue;
                    }
                }
                if let Some((kind, name)) = Self::read_stfs_metadata(&headers_path) {
                    data.content_type = kind;
                    if !name.is_empty() {
                        data.display_name = name;
                    }
                }
            }
            result.push(data);
        }
        result.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        result
    }

    fn read_stfs_metadata(path: &Path) -> Option<(u32, String)> {
        let header = std::fs::read(path).ok()?;
        let kind = header.get(STFS_CONTENT_TYPE_OFFSET..STFS_CONTENT_TYPE_OFFSET + 4)?;
        let kind = u32::from_be_bytes([kind[0], kind[1], kind[2], kind[3]]);

        let name = header
            .get(STFS_DISPLAY_NAME_OFFSET..STFS_DISPLAY_NAME_OFFSET + STFS_DISPLAY_NAME_LEN)
            .map(|raw| {
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .take_while(|&c| c != 0)
                    .collect();
                String::from_utf16_lossy(&units)
            })
            .unwrap_or_default();
        Some((kind, name))
    }

    pub fn content_exists(&self, title_id: u32, data: &ContentData) -> bool {
        self.package_path(title_id, data).exists()
    }

    /// Mount a package and bind `<root_name>:` to it
    pub fn open_content(
        &self,
        root_name: &str,
        title_id: u32,
        data: &ContentData,
    ) -> Result<(), KernelError> {
        let package_path = self.package_path(title_id, data);
        if !package_path.exists() {
            return Err(KernelError::NotFound(package_path.display().to_string()));
        }
        if !package_path.is_dir() {
            return Err(KernelError::NotImplemented(format!(
                "STFS package {} must be extracted to a folder",
                package_path.display()
            )));
        }

        let mut open = self.open_packages.lock();
        if open.iter().any(|p| p.root_name.eq_ignore_ascii_case(root_name)) {
            return Err(KernelError::InvalidState(format!("{}: is already open", root_name)));
        }

        let mount_path = format!(
            "\\Device\\Content\\{}",
            self.next_device.fetch_add(1, Ordering::Relaxed)
        );
        let device = HostPathDevice::new(&mount_path, &package_path, true)?;
        self.vfs.register_device(Arc::new(device))?;
        self.vfs
            .register_symbolic_link(&format!("{}:", root_name), &mount_path);

        info!(
            "Opened content {} as {}: ({})",
            data.file_name, root_name, mount_path
        );
        open.push(OpenPackage {
            root_name: root_name.to_string(),
            mount_path,
            package_path,
        });
        Ok(())
    }

    /// Unbind `<root_name>:` and unmount its package
    pub fn close_content(&self, root_name: &str) -> Result<(), KernelError> {
        let mut open = self.open_packages.lock();
        let index = open
            .iter()
            .position(|p| p.root_name.eq_ignore_ascii_case(root_name))
            .ok_or_else(|| KernelError::NotFound(format!("{}:", root_name)))?;
        let package = open.remove(index);

        self.vfs
            .unregister_symbolic_link(&format!("{}:", package.root_name));
        if !self.vfs.unregister_device(&package.mount_path) {
            warn!("{} was already unmounted", package.mount_path);
        }
        debug!(
            "Closed content {} ({})",
            package.root_name,
            package.package_path.display()
        );
        Ok(())
    }

    pub fn is_open(&self, root_name: &str) -> bool {
        self.open_packages
            .lock()
            .iter()
            .any(|p| p.root_name.eq_ignore_ascii_case(root_name))
    }

    pub fn close_all(&self) {
        let roots: Vec<String> = self
            .open_packages
            .lock()
            .iter()
            .map(|p| p.root_name.clone())
            .collect();
        for root in roots {
            if let Err(e) = self.close_content(&root) {
                warn!("Failed to close content {}: {}", root, e);
            }
        }
    }
}
