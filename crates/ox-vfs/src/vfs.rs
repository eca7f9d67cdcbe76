//! Device table and symbolic links

use crate::device::{Device, OpenFile};
use ox_core::error::VfsError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Convert `/` separators to `\`, collapse repeats and drop a trailing
/// separator
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        let c = if c == '/' { '\\' } else { c };
        if c == '\\' && out.ends_with('\\') {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('\\') {
        out.pop();
    }
    out
}

/// Case-insensitive prefix match that only accepts whole path components
fn strip_prefix_ci<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &path[prefix.len()..];
    if rest.is_empty() || prefix.ends_with('\\') || prefix.ends_with(':') {
        return Some(rest.trim_start_matches('\\'));
    }
    rest.strip_prefix('\\')
}

/// Virtual file system
pub struct VirtualFileSystem {
    devices: RwLock<Vec<Arc<dyn Device>>>,
    /// Lower-cased link name -> target path
    symlinks: RwLock<HashMap<String, String>>,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            symlinks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_device(&self, device: Arc<dyn Device>) -> Result<(), VfsError> {
        let mut devices = self.devices.write();
        let mount = device.mount_path();
        if devices
            .iter()
            .any(|d| d.mount_path().eq_ignore_ascii_case(mount))
        {
            return Err(VfsError::AlreadyRegistered(mount.to_string()));
        }
        info!("Mounted {}", mount);
        devices.push(device);
        Ok(())
    }

    pub fn unregister_device(&self, mount_path: &str) -> bool {
        let mut devices = self.devices.write();
        let before = devices.len();
        devices.retain(|d| !d.mount_path().eq_ignore_ascii_case(mount_path));
        let removed = devices.len() != before;
        if removed {
            info!("Unmounted {}", mount_path);
        }
        removed
    }

    pub fn is_device_registered(&self, mount_path: &str) -> bool {
        self.devices
            .read()
            .iter()
            .any(|d| d.mount_path().eq_ignore_ascii_case(mount_path))
    }

    /// Bind `link` (e.g. `game:`) to `target`, replacing any previous binding
    pub fn register_symbolic_link(&self, link: &str, target: &str) {
        debug!("Symlink {} -> {}", link, target);
        self.symlinks
            .write()
            .insert(link.to_ascii_lowercase(), normalize_path(target));
    }

    pub fn unregister_symbolic_link(&self, link: &str) -> bool {
        self.symlinks
            .write()
            .remove(&link.to_ascii_lowercase())
            .is_some()
    }

    pub fn find_symbolic_link(&self, link: &str) -> Option<String> {
        self.symlinks.read().get(&link.to_ascii_lowercase()).cloned()
    }

    /// Retarget an existing link. Fails when the link is not bound.
    pub fn update_symbolic_link(&self, link: &str, target: &str) -> bool {
        let mut symlinks = self.symlinks.write();
        match symlinks.get_mut(&link.to_ascii_lowercase()) {
            Some(existing) => {
                debug!("Symlink {} retargeted to {}", link, target);
                *existing = normalize_path(target);
                true
            }
            None => false,
        }
    }

    /// Substitute the first matching symbolic link in `path`
    pub fn expand_symbolic_links(&self, path: &str) -> String {
        let path = normalize_path(path);
        let symlinks = self.symlinks.read();
        // Longest link first so `update:` never shadows a longer name
        let mut links: Vec<_> = symlinks.iter().collect();
        links.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        for (link, target) in links {
            if let Some(rest) = strip_prefix_ci(&path, link) {
                return if rest.is_empty() {
                    target.clone()
                } else {
                    format!("{}\\{}", target, rest)
                };
            }
        }
        path
    }

    /// Resolve a guest path to a device entry
    pub fn resolve_path(&self, path: &str) -> Option<OpenFile> {
        let expanded = self.expand_symbolic_links(path);
        let devices = self.devices.read();
        let (device, rest) = devices
            .iter()
            .filter_map(|d| strip_prefix_ci(&expanded, d.mount_path()).map(|rest| (d, rest)))
            .max_by_key(|(d, _)| d.mount_path().len())?;

        trace!("{} -> {}:{}", path, device.mount_path(), rest);
        let entry = device.resolve(rest)?;
        Some(OpenFile {
            device: Arc::clone(device),
            entry,
        })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).is_some()
    }

    /// Read a whole file
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        self.resolve_path(path)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))?
            .read_all()
    }
}

impl Default for VirtualFileSystem {
    fn default() -> Self {
        Self::new()
    }
}
