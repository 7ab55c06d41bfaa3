//! Guest path resolution.
//!
//! Paths from the kernel have the form `\<device>\<partition (optional)>\<name>`,
//! where `device` is `CdRom0` or `Harddisk0` and the partition component is
//! `Partition0`, `Partition1`, ... Separators are backslashes on the wire
//! and are normalized to `/` here.

use std::path::PathBuf;

use crate::request::Device;

/// A guest path broken down for the worker and the FATX engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub device: Device,
    /// Partition number; zero for the config area and for DVD paths.
    pub partition_num: usize,
    /// Path below the device/partition, `/`-separated, empty for the root.
    pub tail: String,
    /// The path the dirent scanner consumes: `Harddisk/Partition<N>/<tail>`
    /// on the hard disk, the bare tail on the DVD.
    pub fatx_path: String,
    /// Where the object lives on the host, below the emulator root.
    pub host_path: PathBuf,
}

/// Splits a guest path. Returns `None` when the path is not of the expected
/// shape or names an unknown device.
pub fn resolve_guest_path(path: &str, base_dir: &std::path::Path) -> Option<ResolvedPath> {
    let path = path.strip_prefix('\\')?;
    let mut components = path.split('\\').filter(|c| !c.is_empty());
    let device = components.next()?;

    if device.eq_ignore_ascii_case("CdRom0") {
        let tail = components.collect::<Vec<_>>().join("/");
        return Some(ResolvedPath {
            device: Device::Dvd,
            partition_num: 0,
            fatx_path: tail.clone(),
            host_path: PathBuf::new(),
            tail,
        });
    }

    if !device.eq_ignore_ascii_case("Harddisk0") {
        log::warn!("Guest path names unknown device {device}");
        return None;
    }

    let partition = components.next()?;
    let partition_num: usize = partition.strip_prefix("Partition")?.parse().ok()?;
    let tail = components.collect::<Vec<_>>().join("/");
    let fatx_path = format!("Harddisk/Partition{partition_num}/{tail}");
    let host_path = base_dir.join(format!("Harddisk/Partition{partition_num}")).join(&tail);

    Some(ResolvedPath { device: Device::Hdd, partition_num, tail, fatx_path, host_path })
}
