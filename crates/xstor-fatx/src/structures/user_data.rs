//! Host-private user data area.
//!
//! The first 4 KiB of every `Partition<N>.bin` file. The guest never sees
//! it; the engine uses it to remember the allocation scan position across
//! runs and to detect dirty shutdowns.

pub const USER_DATA_AREA_SIZE: usize = 4096;

/// Version number of the metadata file layout. A mismatch on boot triggers
/// a reformat, same as the dirty flag.
pub const METADATA_VERSION: u32 = 0;

#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UserDataArea {
    pub reserved1: [u8; 4084],
    /// Last cluster the allocation scan handed out.
    pub last_cluster_used: u32,
    /// Nonzero while the partition is mounted or after a failed metadata
    /// write; cleared only by a clean shutdown.
    pub is_corrupted: u8,
    pub reserved2: [u8; 3],
    pub version: u32,
}

impl UserDataArea {
    pub fn new(last_cluster_used: u32, is_corrupted: bool) -> Self {
        Self {
            last_cluster_used,
            is_corrupted: is_corrupted as u8,
            version: METADATA_VERSION,
            ..bytemuck::Zeroable::zeroed()
        }
    }
}
