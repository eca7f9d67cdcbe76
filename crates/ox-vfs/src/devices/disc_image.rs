//! GDF (XDVDFS) disc image device
//!
//! The game partition sits at one of a handful of known offsets depending
//! on the disc generation. Its volume descriptor lives 32 sectors in and
//! points at the root directory, a table of nodes forming a binary tree
//! sorted by name.

use crate::device::{Device, Entry};
use ox_core::error::VfsError;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SECTOR_SIZE: u64 = 0x800;

/// Volume descriptor magic
pub const GDF_MAGIC: &[u8; 20] = b"MICROSOFT*XBOX*MEDIA";

/// Byte offsets of the game partition on known disc layouts
pub const GAME_PARTITION_OFFSETS: [u64; 5] =
    [0x0000_0000, 0x0000_FB20, 0x0002_0600, 0x0208_0000, 0x0FD9_0000];

const ATTRIBUTE_DIRECTORY: u8 = 0x10;

/// Maximum directory nesting accepted while walking the tree
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct GdfNode {
    name: String,
    is_directory: bool,
    /// Absolute byte offset of the data in the image
    data_offset: u64,
    size: u64,
    children: Vec<GdfNode>,
}

pub struct DiscImageDevice {
    mount_path: String,
    image_path: PathBuf,
    file: Mutex<File>,
    game_offset: u64,
    root: GdfNode,
}

impl DiscImageDevice {
    pub fn open(mount_path: &str, image_path: &Path) -> Result<Self, VfsError> {
        let mut file = File::open(image_path)?;
        let image_size = file.metadata()?.len();

        let (game_offset, root_sector, root_size) = GAME_PARTITION_OFFSETS
            .iter()
            .find_map(|&offset| Self::read_volume_descriptor(&mut file, offset, image_size))
            .ok_or_else(|| {
                VfsError::DeviceInit(format!(
                    "{} has no GDF volume descriptor",
                    image_path.display()
                ))
            })?;
        debug!(
            "GDF partition at 0x{:X}, root sector 0x{:X} (0x{:X} bytes)",
            game_offset, root_sector, root_size
        );

        let children =
            Self::read_directory(&mut file, game_offset, root_sector, root_size, 0)?;
        info!(
            "Opened disc image {} ({} root entries)",
            image_path.display(),
            children.len()
        );

        Ok(Self {
            mount_path: mount_path.to_string(),
            image_path: image_path.to_path_buf(),
            file: Mutex::new(file),
            game_offset,
            root: GdfNode {
                name: String::new(),
                is_directory: true,
                data_offset: game_offset + root_sector as u64 * SECTOR_SIZE,
                size: root_size as u64,
                children,
            },
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn game_offset(&self) -> u64 {
        self.game_offset
    }

    fn read_volume_descriptor(
        file: &mut File,
        game_offset: u64,
        image_size: u64,
    ) -> Option<(u64, u32, u32)> {
        let at = game_offset + 32 * SECTOR_SIZE;
        if at + 28 > image_size {
            return None;
        }
        let mut buf = [0u8; 28];
        file.seek(SeekFrom::Start(at)).ok()?;
        file.read_exact(&mut buf).ok()?;
        if &buf[..20] != GDF_MAGIC {
            return None;
        }
        let root_sector = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let root_size = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        Some((game_offset, root_sector, root_size))
    }

    fn read_directory(
        file: &mut File,
        game_offset: u64,
        sector: u32,
        size: u32,
        depth: usize,
    ) -> Result<Vec<GdfNode>, VfsError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        if depth > MAX_DEPTH {
            return Err(VfsError::DeviceInit("directory tree too deep".into()));
        }
        let mut table = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(game_offset + sector as u64 * SECTOR_SIZE))?;
        file.read_exact(&mut table)?;

        let mut nodes = Vec::new();
        Self::read_node(file, game_offset, &table, 0, depth, &mut nodes, 0)?;
        Ok(nodes)
    }

    /// In-order walk of the node tree rooted at `offset` within `table`
    fn read_node(
        file: &mut File,
        game_offset: u64,
        table: &[u8],
        offset: usize,
        depth: usize,
        out: &mut Vec<GdfNode>,
        visited: usize,
    ) -> Result<(), VfsError> {
        // Each node is at least 14 bytes, so a well-formed table cannot
        // hold more nodes than this
        if visited > table.len() / 14 {
            return Err(VfsError::DeviceInit("directory table loops".into()));
        }
        let header = table
            .get(offset..offset + 14)
            .ok_or_else(|| VfsError::DeviceInit(format!("node at 0x{:x} truncated", offset)))?;
        let left = u16::from_le_bytes([header[0], header[1]]);
        let right = u16::from_le_bytes([header[2], header[3]]);
        // Empty directories are a single node of 0xFF padding
        if left == 0xFFFF && right == 0xFFFF {
            return Ok(());
        }
        let sector = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let length = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let attributes = header[12];
        let name_len = header[13] as usize;
        let name = table
            .get(offset + 14..offset + 14 + name_len)
            .ok_or_else(|| VfsError::DeviceInit(format!("node name at 0x{:x} truncated", offset)))?;
        let name = String::from_utf8_lossy(name).into_owned();

        if left != 0 {
            Self::read_node(file, game_offset, table, left as usize * 4, depth, out, visited + 1)?;
        }

        let is_directory = attributes & ATTRIBUTE_DIRECTORY != 0;
        let children = if is_directory {
            Self::read_directory(file, game_offset, sector, length, depth + 1)?
        } else {
            Vec::new()
        };
        out.push(GdfNode {
            name,
            is_directory,
            data_offset: game_offset + sector as u64 * SECTOR_SIZE,
            size: length as u64,
            children,
        });

        if right != 0 {
            Self::read_node(file, game_offset, table, right as usize * 4, depth, out, visited + 1)?;
        }
        Ok(())
    }

    fn find(&self, path: &str) -> Option<(&GdfNode, String)> {
        let mut node = &self.root;
        let mut spelled = Vec::new();
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            node = node
                .children
                .iter()
                .find(|child| child.name.eq_ignore_ascii_case(component))?;
            spelled.push(node.name.as_str());
        }
        Some((node, spelled.join("\\")))
    }

    fn to_entry(node: &GdfNode, path: String) -> Entry {
        Entry {
            name: node.name.clone(),
            path,
            is_directory: node.is_directory,
            size: if node.is_directory { 0 } else { node.size },
        }
    }
}

impl Device for DiscImageDevice {
    fn mount_path(&self) -> &str {
        &self.mount_path
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn resolve(&self, path: &str) -> Option<Entry> {
        let (node, spelled) = self.find(path)?;
        Some(Self::to_entry(node, spelled))
    }

    fn read(&self, entry: &Entry) -> Result<Vec<u8>, VfsError> {
        let (node, _) = self
            .find(&entry.path)
            .ok_or_else(|| VfsError::NotFound(entry.path.clone()))?;
        let mut data = vec![0u8; node.size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(node.data_offset))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    fn list(&self, entry: &Entry) -> Result<Vec<Entry>, VfsError> {
        let (node, spelled) = self
            .find(&entry.path)
            .ok_or_else(|| VfsError::NotFound(entry.path.clone()))?;
        Ok(node
            .children
            .iter()
            .map(|child| {
                let path = if spelled.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}\\{}", spelled, child.name)
                };
                Self::to_entry(child, path)
            })
            .collect())
    }
}

/// Build a small GDF image: a root directory holding `files`, laid out
/// as a right-leaning node chain. Used by tests.
pub fn build_test_image(files: &[(&str, &[u8])]) -> Vec<u8> {
    let root_sector = 33u32;
    let mut table = Vec::new();
    let mut data_sector = root_sector + 1;
    let mut placements = Vec::new();

    for (index, (name, contents)) in files.iter().enumerate() {
        let node_len = (14 + name.len() + 3) & !3;
        let next = table.len() + node_len;
        let right = if index + 1 < files.len() { (next / 4) as u16 } else { 0 };
        table.extend_from_slice(&0u16.to_le_bytes());
        table.extend_from_slice(&right.to_le_bytes());
        table.extend_from_slice(&data_sector.to_le_bytes());
        table.extend_from_slice(&(contents.len() as u32).to_le_bytes());
        table.push(0x80);
        table.push(name.len() as u8);
        table.extend_from_slice(name.as_bytes());
        table.resize(next, 0xFF);

        placements.push((data_sector, *contents));
        data_sector += ((contents.len() as u64 + SECTOR_SIZE - 1) / SECTOR_SIZE).max(1) as u32;
    }

    let mut image = vec![0u8; data_sector as usize * SECTOR_SIZE as usize];
    let descriptor = 32 * SECTOR_SIZE as usize;
    image[descriptor..descriptor + 20].copy_from_slice(GDF_MAGIC);
    image[descriptor + 20..descriptor + 24].copy_from_slice(&root_sector.to_le_bytes());
    image[descriptor + 24..descriptor + 28].copy_from_slice(&(table.len() as u32).to_le_bytes());

    let root = root_sector as usize * SECTOR_SIZE as usize;
    image[root..root + table.len()].copy_from_slice(&table);
    for (sector, contents) in placements {
        let at = sector as usize * SECTOR_SIZE as usize;
        image[at..at + contents.len()].copy_from_slice(contents);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.iso");
        std::fs::write(
            &path,
            build_test_image(&[("default.xex", b"XEX2"), ("media.bin", b"data")]),
        )
        .unwrap();

        let device = DiscImageDevice::open("\\Device\\Cdrom0", &path).unwrap();
        assert_eq!(device.game_offset(), 0);

        let entry = device.resolve("DEFAULT.XEX").unwrap();
        assert_eq!(entry.path, "default.xex");
        assert_eq!(device.read(&entry).unwrap(), b"XEX2");

        let root = device.resolve("").unwrap();
        let names: Vec<_> = device.list(&root).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["default.xex", "media.bin"]);

        assert!(device.resolve("missing.xex").is_none());
    }

    #[test]
    fn test_rejects_non_gdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.iso");
        std::fs::write(&path, vec![0u8; 0x20000]).unwrap();
        assert!(matches!(
            DiscImageDevice::open("\\Device\\Cdrom0", &path),
            Err(VfsError::DeviceInit(_))
        ));
    }
}
