//! FATX virtual disk engine.
//!
//! This crate virtualizes the hard disk of an original Xbox: a partition
//! table plus six partitions, of which partition 0 is the raw configuration
//! area and partitions 1..=5 are FATX16/FATX32 volumes. The guest sees
//! bit-exact FATX semantics while the host stores everything in a compact
//! form:
//!
//! - `Harddisk/Partition<N>.bin` holds a private user data area, the FATX
//!   superblock, the FAT, the root dirent stream and a dynamically growing
//!   blob area for further dirent streams and raw clusters.
//! - `Harddisk/ClusterTable<N>.bin` is an indirection table mapping every
//!   allocated FAT cluster to where its bytes actually live.
//! - File contents are plain host files under `Harddisk/Partition<N>/`, so
//!   the host filesystem manages the bulk of the disk space.
//!
//! The [`PartitionManager`] owns every partition's state and is intended to
//! be driven from a single I/O thread; see the `xstor-io` crate.

pub mod cluster_table;
pub mod dirent_stream;
pub mod error;
pub mod fat;
pub mod metadata;
pub mod partition;
pub mod raw;
pub mod structures;

pub use cluster_table::ClusterInfo;
pub use dirent_stream::FindResult;
pub use error::{FsError, Status};
pub use metadata::{check_file_access, AccessCheckFlags};
pub use partition::{Partition, PartitionManager};
pub use structures::dirent::{Dirent, FileAttributes, FATX_MAX_FILE_LENGTH};
