//! Virtual file system for oxidized-xenon
//!
//! Guest paths look like `game:\default.xex` or
//! `\Device\Cdrom0\media\intro.wmv`. Symbolic links such as `game:` are
//! substituted first, then the longest matching device mount path selects
//! the [`Device`] that serves the remainder.

pub mod device;
pub mod devices;
pub mod vfs;

pub use device::{Device, Entry, OpenFile};
pub use devices::{disc_image::DiscImageDevice, host_path::HostPathDevice};
pub use vfs::VirtualFileSystem;

/// Mount point used for naked executables (host directory)
pub const HARDDISK_MOUNT_PATH: &str = "\\Device\\Harddisk0\\Partition0";
/// Mount point used for disc images and package containers
pub const CDROM_MOUNT_PATH: &str = "\\Device\\Cdrom0";
