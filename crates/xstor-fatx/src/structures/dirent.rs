//! The 64-byte FATX directory entry.

use crate::error::FsError;

pub const FATX_MAX_FILE_LENGTH: usize = 42;
pub const DIRENT_SIZE: usize = 64;

/// End-of-stream marker, also the value of a never-used slot.
pub const DIRENT_END1: u8 = 0x00;
/// Deleted entry; the slot is reusable but the stream continues past it.
pub const DIRENT_DELETED: u8 = 0xE5;
/// End-of-stream marker used when formatting (clusters are filled with 0xFF).
pub const DIRENT_END2: u8 = 0xFF;

bitflags::bitflags! {
    /// FATX file attributes.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u8 {
        const READ_ONLY = 0x01;
        const DIRECTORY = 0x10;
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Dirent {
    pub name_length: u8,
    pub attributes: u8,
    pub name: [u8; FATX_MAX_FILE_LENGTH],
    pub first_cluster: u32,
    pub size: u32,
    pub creation_time: u32,
    pub last_write_time: u32,
    pub last_access_time: u32,
}

impl Dirent {
    /// Builds a dirent for a new file or directory. Names longer than 42
    /// bytes are rejected here, before any cluster allocation can happen.
    pub fn new(
        name: &str,
        attributes: FileAttributes,
        size: u32,
        timestamp: u32,
    ) -> Result<Self, FsError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > FATX_MAX_FILE_LENGTH {
            return Err(FsError::Failed);
        }
        let mut name_buf = [DIRENT_END2; FATX_MAX_FILE_LENGTH];
        name_buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            name_length: bytes.len() as u8,
            attributes: attributes.bits(),
            name: name_buf,
            first_cluster: 0,
            size,
            creation_time: timestamp,
            last_write_time: timestamp,
            last_access_time: timestamp,
        })
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = (self.name_length as usize).min(FATX_MAX_FILE_LENGTH);
        &self.name[..len]
    }

    pub fn file_attributes(&self) -> FileAttributes {
        FileAttributes::from_bits_truncate(self.attributes)
    }

    pub fn is_directory(&self) -> bool {
        self.file_attributes().contains(FileAttributes::DIRECTORY)
    }

    /// True for both end-of-stream markers and deleted entries, i.e. any
    /// slot a new dirent may be written into.
    pub fn is_free(&self) -> bool {
        matches!(self.name_length, DIRENT_END1 | DIRENT_DELETED | DIRENT_END2)
    }

    /// True end-of-stream marker (a deleted entry is not one: the stream
    /// may continue past it).
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.name_length, DIRENT_END1 | DIRENT_END2)
    }

    pub fn is_deleted(&self) -> bool {
        self.name_length == DIRENT_DELETED
    }
}
