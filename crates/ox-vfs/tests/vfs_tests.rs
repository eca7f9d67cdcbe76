//! Path resolution across devices and links

use ox_vfs::devices::disc_image::build_test_image;
use ox_vfs::{Device, DiscImageDevice, HostPathDevice, VirtualFileSystem, CDROM_MOUNT_PATH, HARDDISK_MOUNT_PATH};
use std::sync::Arc;

#[test]
fn test_resolve_through_game_link() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("game.xex"), b"XEX2").unwrap();

    let vfs = VirtualFileSystem::new();
    let device = HostPathDevice::new(HARDDISK_MOUNT_PATH, dir.path(), true).unwrap();
    vfs.register_device(Arc::new(device)).unwrap();
    vfs.register_symbolic_link("game:", HARDDISK_MOUNT_PATH);
    vfs.register_symbolic_link("d:", HARDDISK_MOUNT_PATH);

    assert_eq!(vfs.read_file("game:\\game.xex").unwrap(), b"XEX2");
    assert_eq!(vfs.read_file("D:/GAME.XEX").unwrap(), b"XEX2");
    assert!(vfs.exists("\\Device\\Harddisk0\\Partition0\\game.xex"));
    assert!(!vfs.exists("game:\\other.xex"));

    let file = vfs.resolve_path("game:\\game.xex").unwrap();
    assert!(file.device.is_read_only());
    assert_eq!(file.host_path().unwrap(), dir.path().join("game.xex"));
}

#[test]
fn test_duplicate_mount_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let vfs = VirtualFileSystem::new();
    vfs.register_device(Arc::new(HostPathDevice::new(CDROM_MOUNT_PATH, dir.path(), true).unwrap()))
        .unwrap();
    assert!(vfs
        .register_device(Arc::new(HostPathDevice::new(CDROM_MOUNT_PATH, dir.path(), true).unwrap()))
        .is_err());
    assert!(vfs.unregister_device(CDROM_MOUNT_PATH));
    assert!(!vfs.is_device_registered(CDROM_MOUNT_PATH));
}

#[test]
fn test_longest_mount_wins() {
    let outer = tempfile::tempdir().unwrap();
    let inner = tempfile::tempdir().unwrap();
    std::fs::write(outer.path().join("a.bin"), b"outer").unwrap();
    std::fs::write(inner.path().join("a.bin"), b"inner").unwrap();

    let vfs = VirtualFileSystem::new();
    vfs.register_device(Arc::new(HostPathDevice::new("\\Device\\Content", outer.path(), true).unwrap()))
        .unwrap();
    vfs.register_device(Arc::new(
        HostPathDevice::new("\\Device\\Content\\0", inner.path(), true).unwrap(),
    ))
    .unwrap();

    assert_eq!(vfs.read_file("\\Device\\Content\\0\\a.bin").unwrap(), b"inner");
    assert_eq!(vfs.read_file("\\Device\\Content\\a.bin").unwrap(), b"outer");
}

#[test]
fn test_disc_image_mount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disc.iso");
    std::fs::write(&path, build_test_image(&[("default.xex", b"XEX2")])).unwrap();

    let vfs = VirtualFileSystem::new();
    vfs.register_device(Arc::new(DiscImageDevice::open(CDROM_MOUNT_PATH, &path).unwrap()))
        .unwrap();
    vfs.register_symbolic_link("game:", CDROM_MOUNT_PATH);

    assert_eq!(vfs.read_file("game:\\default.xex").unwrap(), b"XEX2");
    assert!(vfs.resolve_path("game:\\GameInfo.bin").is_none());
}
