//! On-disk structures of the virtual Xbox hard disk.
//!
//! Everything in here is bit-exact: the partition table and superblock are
//! what the guest kernel reads through raw partition I/O, the dirent is the
//! unit of the FATX directory streams, and the user data area plus cluster
//! table entry are the host-private bookkeeping prepended to the partition
//! files. Layouts are pinned by `const_assert_eq` tests so they cannot
//! drift.

pub mod cluster_entry;
pub mod dirent;
pub mod partition_table;
pub mod superblock;
pub mod user_data;

/// Sector size of the emulated hard disk, in bytes.
pub const HDD_SECTOR_SIZE: u64 = 512;

/// Size of the raw configuration area exposed as partition 0.
pub const CONFIG_AREA_SIZE: u64 = 0x80000;

/// Offset of the FAT inside a `Partition<N>.bin` file: it sits right after
/// the host-private user data area and the superblock.
pub const METADATA_FAT_OFFSET: u64 =
    (user_data::USER_DATA_AREA_SIZE + superblock::SUPERBLOCK_SIZE) as u64;

/// Number of partitions on a stock Xbox disk, including the config area.
pub const XBOX_NUM_OF_PARTITIONS: usize = 6;
