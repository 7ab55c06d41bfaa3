//! The 4 KiB FATX superblock.

use super::HDD_SECTOR_SIZE;

pub const SUPERBLOCK_SIZE: usize = 4096;
pub const FATX_NAME_LENGTH: usize = 32;
pub const FATX_ONLINE_DATA_LENGTH: usize = 2048;
pub const FATX_RESERVED_LENGTH: usize = 1968;

/// `XTAF` read big-endian, so the file starts with the ASCII bytes `FATX`.
pub const FATX_SIGNATURE: u32 = u32::from_be_bytes(*b"XTAF");

#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Superblock {
    pub signature: u32,
    pub volume_id: u32,
    /// Cluster size in 512-byte sectors, a power of two in 1..=128.
    pub cluster_size: u32,
    pub root_dir_cluster: u32,
    pub name: [u16; FATX_NAME_LENGTH],
    pub online_data: [u8; FATX_ONLINE_DATA_LENGTH],
    pub reserved: [u8; FATX_RESERVED_LENGTH],
}

impl Superblock {
    /// Superblock written when a partition is formatted from scratch.
    pub fn new_default(partition_num: u32) -> Self {
        let mut sb = Self {
            signature: FATX_SIGNATURE,
            volume_id: 11223344 + partition_num,
            cluster_size: 32,
            root_dir_cluster: 1,
            ..bytemuck::Zeroable::zeroed()
        };
        sb.reserved = [0xFF; FATX_RESERVED_LENGTH];
        sb
    }

    pub fn has_valid_signature(&self) -> bool {
        let signature = self.signature;
        signature == FATX_SIGNATURE
    }

    /// True when the cluster size field holds one of the legal sector counts.
    pub fn has_valid_cluster_size(&self) -> bool {
        matches!(self.cluster_size, 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128)
    }

    pub fn cluster_size_bytes(&self) -> u64 {
        self.cluster_size as u64 * HDD_SECTOR_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<Superblock>(), SUPERBLOCK_SIZE);
    const_assert_eq!(align_of::<Superblock>(), 1);
    const_assert_eq!(offset_of!(Superblock, name), 16);
    const_assert_eq!(offset_of!(Superblock, online_data), 80);
    const_assert_eq!(offset_of!(Superblock, reserved), 2128);

    #[test]
    fn signature_serializes_as_fatx() {
        let sb = Superblock::new_default(2);
        let bytes = bytemuck::bytes_of(&sb);
        assert_eq!(&bytes[0..4], b"FATX");
        assert_eq!(sb.cluster_size_bytes(), 16384);
        assert!(sb.has_valid_signature());
        assert!(sb.has_valid_cluster_size());
    }

    #[test]
    fn cluster_size_validation() {
        let mut sb = Superblock::new_default(1);
        sb.cluster_size = 3;
        assert!(!sb.has_valid_cluster_size());
        sb.cluster_size = 256;
        assert!(!sb.has_valid_cluster_size());
        sb.cluster_size = 1;
        assert!(sb.has_valid_cluster_size());
    }
}
