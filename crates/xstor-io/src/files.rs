//! Small host filesystem helpers used by the worker.

use std::fs::{File, OpenOptions};
use std::path::Path;

/// Creates (or truncates) a file opened for reading and writing. This can
/// still fail even with these options, e.g. when the file is read-only on
/// the host filesystem.
pub fn create_file(path: &Path) -> Option<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .inspect_err(|err| log::info!("Failed to create file {}: {err}", path.display()))
        .ok()
}

pub fn open_file(path: &Path) -> Option<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .inspect_err(|err| log::info!("Failed to open file {}: {err}", path.display()))
        .ok()
}

pub fn create_directory(path: &Path) -> bool {
    match std::fs::create_dir_all(path) {
        Ok(()) => true,
        Err(err) => {
            log::info!("Failed to create directory {}: {err}", path.display());
            false
        }
    }
}
