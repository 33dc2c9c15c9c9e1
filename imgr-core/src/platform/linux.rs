use crate::device::Device;
use anyhow::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SYS_BLOCK: &str = "/sys/block";

/// Helper to read a file below a sysfs directory, trimmed.
fn read_sys_file(dir: &Path, file: &str) -> io::Result<String> {
    fs::read_to_string(dir.join(file)).map(|s| s.trim().to_string())
}

/// Size in bytes from the sysfs `size` attribute, which always counts
/// 512-byte sectors regardless of the logical block size.
fn sys_size_bytes(dir: &Path) -> Option<u64> {
    read_sys_file(dir, "size")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|sectors| sectors * 512)
}

fn mount_point_of(disks: &sysinfo::Disks, device_name: &str) -> String {
    disks
        .iter()
        .find(|disk| {
            disk.name()
                .to_string_lossy()
                .trim_start_matches("/dev/")
                == device_name
        })
        .map(|disk| disk.mount_point().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Lists block devices and their partitions on a Linux system.
///
/// Only entries in `/sys/block` that have a backing `device` node are
/// considered, which leaves out purely virtual devices such as `loop` and
/// `ram` nodes. For every such disk, its partitions (subdirectories carrying
/// a `start` attribute) follow it in the returned list.
///
/// Devices that report a size of zero (e.g. an empty card reader or a drive
/// without a disc) are still listed, since an optical drive is commonly
/// selected before the disc is inserted.
///
/// # Returns
///
/// A `Result<Vec<Device>>` ordered disk-then-partitions, or an error if
/// `/sys/block` cannot be read.
pub fn list_block_devices() -> Result<Vec<Device>> {
    let disks = sysinfo::Disks::new_with_refreshed_list();

    let mut entries: Vec<_> = fs::read_dir(SYS_BLOCK)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.join("device").exists())
        .collect();
    entries.sort();

    let mut devices = Vec::new();
    for sys_dir in entries {
        let Some(name) = sys_dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };

        devices.push(Device {
            path: PathBuf::from("/dev/").join(&name),
            size_bytes: sys_size_bytes(&sys_dir).unwrap_or(0),
            mount_point: mount_point_of(&disks, &name),
            name,
        });

        let mut partitions: Vec<_> = fs::read_dir(&sys_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.join("start").exists())
            .collect();
        partitions.sort();

        for part_dir in partitions {
            let Some(part_name) = part_dir.file_name().map(|n| n.to_string_lossy().to_string())
            else {
                continue;
            };
            devices.push(Device {
                path: PathBuf::from("/dev/").join(&part_name),
                size_bytes: sys_size_bytes(&part_dir).unwrap_or(0),
                mount_point: mount_point_of(&disks, &part_name),
                name: part_name,
            });
        }
    }

    Ok(devices)
}
