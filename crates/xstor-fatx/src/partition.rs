//! Per-partition state and the partition manager.
//!
//! Each FATX partition owns its host file handles, cluster accounting and
//! scanner scratch. The [`PartitionManager`] builds the set at startup,
//! translates disk offsets, and is the single owner handed to the I/O
//! worker; nothing here is shared between threads.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use xstor_common::util::align_up;

use crate::cluster_table::ClusterTable;
use crate::error::FsError;
use crate::fat::{self, FatKind};
use crate::structures::dirent::DIRENT_END2;
use crate::structures::partition_table::{PartitionTable, PartitionTableEntry};
use crate::structures::superblock::{Superblock, SUPERBLOCK_SIZE};
use crate::structures::user_data::{UserDataArea, METADATA_VERSION, USER_DATA_AREA_SIZE};
use crate::structures::{CONFIG_AREA_SIZE, METADATA_FAT_OFFSET, XBOX_NUM_OF_PARTITIONS};

/// Errors raised while bringing the virtual disk up.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition {0} has an invalid superblock")]
    InvalidSuperblock(usize),
    #[error("partition {0} has no usable partition table entry")]
    MissingTableEntry(usize),
}

/// Scratch the dirent scanner shares with the create/overwrite/delete that
/// follows it for the same file. Safe because both run on the I/O worker
/// and are serialized by the request queue.
#[derive(Default)]
pub(crate) struct ScannerState {
    pub(crate) last_dirent_stream_cluster: u32,
    pub(crate) last_found_dirent_offset: u64,
    pub(crate) last_free_dirent_offset: u64,
    pub(crate) last_free_dirent_is_on_boundary: bool,
}

/// One mounted FATX partition.
pub struct Partition {
    pub(crate) num: usize,
    pub(crate) base_dir: PathBuf,
    /// `Harddisk/Partition<N>.bin`
    pub(crate) file: File,
    pub(crate) table: ClusterTable,
    pub(crate) cluster_size: u64,
    pub(crate) cluster_shift: u32,
    pub(crate) cluster_tot_num: u64,
    pub(crate) cluster_free_num: u64,
    /// Size of the FAT region, aligned to 4096.
    pub(crate) metadata_fat_size: u64,
    /// Current length of the partition blob file.
    pub(crate) metadata_file_size: u64,
    pub(crate) last_allocated_cluster: u32,
    pub(crate) is_corrupted: bool,
    pub(crate) scanner: ScannerState,
}

impl Partition {
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub fn total_clusters(&self) -> u64 {
        self.cluster_tot_num
    }

    pub fn free_cluster_num(&self) -> u64 {
        self.cluster_free_num
    }

    pub fn is_corrupted(&self) -> bool {
        self.is_corrupted
    }

    /// Offset of the free dirent slot the last failed lookup stopped at;
    /// a following create writes the new dirent there.
    pub fn last_free_dirent_offset(&self) -> u64 {
        self.scanner.last_free_dirent_offset
    }

    /// Offset of the dirent the last successful lookup returned.
    pub fn last_found_dirent_offset(&self) -> u64 {
        self.scanner.last_found_dirent_offset
    }

    pub(crate) fn fat_kind(&self) -> FatKind {
        FatKind::for_partition(self.num)
    }

    /// Path string stored on disk for a file living on this partition.
    pub(crate) fn stored_path_for(&self, tail: &str) -> String {
        format!("Harddisk/Partition{}/{}", self.num, tail)
    }

    /// Marks the partition metadata as corrupted. The state is sticky until
    /// the next boot, which reformats the partition.
    pub(crate) fn set_corrupted(&mut self) {
        if !self.is_corrupted {
            log::error!(
                "Partition {} metadata files have become corrupted, they will be recreated on the next launch",
                self.num
            );
            self.is_corrupted = true;
        }
    }

    pub(crate) fn fail_if_corrupted(&self) -> Result<(), FsError> {
        if self.is_corrupted { Err(FsError::Error) } else { Ok(()) }
    }

    fn open_or_create(
        base_dir: &Path,
        hdd_dir: &Path,
        num: usize,
        table: &PartitionTable,
    ) -> Result<Self, InitError> {
        let partition_bin = hdd_dir.join(format!("Partition{num}.bin"));
        let table_path = hdd_dir.join(format!("ClusterTable{num}.bin"));

        let entry = *table
            .entry_for_partition(num)
            .filter(|e| e.size_bytes() != 0)
            .ok_or(InitError::MissingTableEntry(num))?;

        if !partition_bin.exists() || !table_path.exists() {
            let file = create_file(&partition_bin)?;
            let cluster_table = ClusterTable::create(table_path)?;
            let mut partition = Self::with_files(base_dir, num, file, cluster_table);
            partition.format_fresh(&entry)?;
            return Ok(partition);
        }

        let mut file = open_file(&partition_bin)?;
        let metadata_file_size = file.metadata()?.len();

        let mut header = [0u8; USER_DATA_AREA_SIZE + SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let user_area: &UserDataArea =
            bytemuck::from_bytes(&header[..USER_DATA_AREA_SIZE]);
        let last_cluster_used = user_area.last_cluster_used;
        let is_corrupted = user_area.is_corrupted;
        let version = user_area.version;

        if is_corrupted != 0 || version != METADATA_VERSION {
            log::warn!(
                "Partition {num} metadata was not shut down cleanly, recreating it"
            );
            let file = create_file(&partition_bin)?;
            let cluster_table = ClusterTable::create(table_path)?;
            let mut partition = Self::with_files(base_dir, num, file, cluster_table);
            partition.format_fresh(&entry)?;
            return Ok(partition);
        }

        let superblock: &Superblock = bytemuck::from_bytes(&header[USER_DATA_AREA_SIZE..]);
        if !superblock.has_valid_cluster_size() {
            return Err(InitError::InvalidSuperblock(num));
        }
        let cluster_size = superblock.cluster_size_bytes();

        let cluster_table = ClusterTable::open(table_path)?;
        let mut partition = Self::with_files(base_dir, num, file, cluster_table);
        partition.metadata_file_size = metadata_file_size;
        partition.cluster_size = cluster_size;
        partition.cluster_shift = cluster_size.trailing_zeros();
        partition.cluster_tot_num = (entry.size_bytes() >> partition.cluster_shift) + 1;
        partition.metadata_fat_size = align_up(
            partition.cluster_tot_num * partition.fat_kind().entry_size(),
            4096,
        );
        partition.last_allocated_cluster = last_cluster_used;
        partition.cluster_free_num = partition.count_free_clusters().map_err(|_| {
            InitError::Io(std::io::Error::other(format!(
                "failed to scan the FAT of partition {num}"
            )))
        })?;

        // The partition is now mounted: mark it dirty so that a shutdown
        // without a clean flush triggers a reformat on the next boot.
        partition.write_user_data(true)?;

        Ok(partition)
    }

    fn with_files(base_dir: &Path, num: usize, file: File, table: ClusterTable) -> Self {
        Self {
            num,
            base_dir: base_dir.to_path_buf(),
            file,
            table,
            cluster_size: 0,
            cluster_shift: 0,
            cluster_tot_num: 0,
            cluster_free_num: 0,
            metadata_fat_size: 0,
            metadata_file_size: 0,
            last_allocated_cluster: 1,
            is_corrupted: false,
            scanner: ScannerState::default(),
        }
    }

    /// Formats the partition with the default superblock.
    fn format_fresh(&mut self, entry: &PartitionTableEntry) -> Result<(), std::io::Error> {
        let superblock = Superblock::new_default(self.num as u32);
        self.file.set_len(0)?;
        self.write_user_data(true)?;
        self.file.seek(SeekFrom::Start(USER_DATA_AREA_SIZE as u64))?;
        self.file.write_all(bytemuck::bytes_of(&superblock))?;
        self.format_common(superblock.cluster_size, entry.size_bytes())
    }

    /// Reformats the partition using a guest-written superblock as template.
    /// The signature is deliberately not validated first.
    pub(crate) fn format_with_superblock(
        &mut self,
        sb_bytes: &[u8; SUPERBLOCK_SIZE],
        partition_len: u64,
    ) -> Result<(), FsError> {
        let superblock: Superblock = *bytemuck::from_bytes(sb_bytes);
        if !superblock.has_valid_cluster_size() {
            self.set_corrupted();
            return Err(FsError::Corrupt);
        }
        match self.format_from_template(sb_bytes, superblock.cluster_size, partition_len) {
            Ok(()) => Ok(()),
            Err(err) => {
                log::error!("Failed to reformat partition {}: {err}", self.num);
                self.set_corrupted();
                Err(FsError::Error)
            }
        }
    }

    fn format_from_template(
        &mut self,
        sb_bytes: &[u8; SUPERBLOCK_SIZE],
        cluster_size_sectors: u32,
        partition_len: u64,
    ) -> Result<(), std::io::Error> {
        self.file.set_len(0)?;
        self.last_allocated_cluster = 1;
        self.write_user_data(true)?;
        self.file.seek(SeekFrom::Start(USER_DATA_AREA_SIZE as u64))?;
        self.file.write_all(sb_bytes)?;
        self.format_common(cluster_size_sectors, partition_len)
    }

    /// Shared tail of every format path: sizes the partition, writes a fresh
    /// FAT and root dirent cluster, and resets the cluster table.
    fn format_common(
        &mut self,
        cluster_size_sectors: u32,
        partition_len: u64,
    ) -> Result<(), std::io::Error> {
        self.cluster_size = cluster_size_sectors as u64 * crate::structures::HDD_SECTOR_SIZE;
        self.cluster_shift = self.cluster_size.trailing_zeros();
        self.cluster_tot_num = (partition_len >> self.cluster_shift) + 1;
        self.cluster_free_num = self.cluster_tot_num - 2;
        self.metadata_fat_size = align_up(
            self.cluster_tot_num * self.fat_kind().entry_size(),
            4096,
        );
        self.metadata_file_size =
            METADATA_FAT_OFFSET + self.metadata_fat_size + self.cluster_size;
        self.last_allocated_cluster = 1;
        self.is_corrupted = false;
        self.scanner = ScannerState::default();

        // FAT: all clusters free except the root marker and its end of chain.
        let mut fat = vec![0u8; self.metadata_fat_size as usize];
        let kind = self.fat_kind();
        kind.encode(fat::constants::FATX32_CLUSTER_ROOT, &mut fat[..]);
        let esz = kind.entry_size() as usize;
        kind.encode(fat::constants::FATX32_CLUSTER_EOC, &mut fat[esz..]);
        self.file.seek(SeekFrom::Start(METADATA_FAT_OFFSET))?;
        self.file.write_all(&fat)?;

        // Root dirent stream: one cluster of end-of-stream markers.
        let root = vec![DIRENT_END2; self.cluster_size as usize];
        self.file.write_all(&root)?;

        // Cluster table: a single element with cluster 1 indexed as the root
        // dirent stream.
        self.table
            .reset_with_root(METADATA_FAT_OFFSET + self.metadata_fat_size)?;

        Ok(())
    }

    pub(crate) fn write_user_data(&mut self, dirty: bool) -> Result<(), std::io::Error> {
        let area = UserDataArea::new(self.last_allocated_cluster, dirty);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(bytemuck::bytes_of(&area))
    }

    /// Clean-shutdown flush of the user data area. A corrupted partition is
    /// left dirty on purpose so the next boot recreates it.
    fn flush_user_data(&mut self) {
        if self.is_corrupted {
            return;
        }
        if let Err(err) = self.write_user_data(false) {
            log::error!(
                "Failed to flush Partition{}.bin file, it will be recreated on the next launch: {err}",
                self.num
            );
        }
    }
}

/// Owner of the whole virtual disk: the config area, the partition table
/// snapshot and every mounted FATX partition.
pub struct PartitionManager {
    base_dir: PathBuf,
    /// `Partition0.bin`
    pub(crate) config: File,
    pub(crate) table: PartitionTable,
    partitions: Vec<Partition>,
}

impl PartitionManager {
    /// Opens or creates the whole `Harddisk/` tree under `base_dir`.
    pub fn init(base_dir: &Path) -> Result<Self, InitError> {
        let hdd_dir = base_dir.join("Harddisk");
        std::fs::create_dir_all(&hdd_dir)?;
        for num in 1..8 {
            std::fs::create_dir_all(hdd_dir.join(format!("Partition{num}")))?;
        }

        let config_bin = hdd_dir.join("Partition0.bin");
        let (config, table) = if config_bin.exists() {
            let mut config = open_file(&config_bin)?;
            let mut raw = [0u8; size_of::<PartitionTable>()];
            config.seek(SeekFrom::Start(0))?;
            config.read_exact(&mut raw)?;
            let table: PartitionTable = *bytemuck::from_bytes(&raw);
            let table = if table.has_valid_magic() {
                table
            } else {
                PartitionTable::hdd_default()
            };
            (config, table)
        } else {
            let mut config = create_file(&config_bin)?;
            let table = PartitionTable::hdd_default();
            let mut image = vec![0u8; CONFIG_AREA_SIZE as usize];
            image[..size_of::<PartitionTable>()]
                .copy_from_slice(bytemuck::bytes_of(&table));
            config.write_all(&image)?;
            (config, table)
        };

        let mut partitions = Vec::with_capacity(XBOX_NUM_OF_PARTITIONS - 1);
        for num in 1..XBOX_NUM_OF_PARTITIONS {
            partitions.push(Partition::open_or_create(base_dir, &hdd_dir, num, &table)?);
        }

        Ok(Self { base_dir: base_dir.to_path_buf(), config, table, partitions })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn partition_table(&self) -> &PartitionTable {
        &self.table
    }

    /// The mounted partition with the given number (1..=5).
    pub fn partition(&mut self, num: usize) -> Result<&mut Partition, FsError> {
        self.partitions.get_mut(num.wrapping_sub(1)).ok_or_else(|| {
            log::warn!("Request targets unknown partition {num}");
            FsError::Error
        })
    }

    /// Translates an absolute disk offset into (partition number, offset).
    pub fn disk_offset_to_partition_offset(&self, disk_offset: u64) -> Option<(usize, u64)> {
        self.table.partition_for_disk_offset(disk_offset)
    }

    /// Clean shutdown: every healthy partition gets its user data area
    /// rewritten with the dirty flag cleared.
    pub fn flush(&mut self) {
        for partition in &mut self.partitions {
            partition.flush_user_data();
        }
    }

    /// Re-reads the partition table snapshot from the config area file.
    pub(crate) fn reload_partition_table(&mut self) -> Result<(), FsError> {
        let mut raw = [0u8; size_of::<PartitionTable>()];
        self.config
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.config.read_exact(&mut raw))
            .map_err(|err| {
                log::error!("Failed to re-read the partition table: {err}");
                FsError::Error
            })?;
        self.table = *bytemuck::from_bytes(&raw);
        Ok(())
    }
}

pub(crate) fn create_file(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .inspect_err(|err| log::warn!("Failed to create {}: {err}", path.display()))
}

pub(crate) fn open_file(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .inspect_err(|err| log::warn!("Failed to open {}: {err}", path.display()))
}

/// Seek + read_exact, mapped onto the engine error taxonomy.
pub(crate) fn read_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(buf))
        .map_err(|_| FsError::Error)
}

/// Seek + write_all, mapped onto the engine error taxonomy.
pub(crate) fn write_at(file: &mut File, offset: u64, buf: &[u8]) -> Result<(), FsError> {
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(buf))
        .map_err(|_| FsError::Error)
}

/// Appends at the end of the file and returns the offset the data landed at.
pub(crate) fn append(file: &mut File, buf: &[u8]) -> Result<u64, FsError> {
    let offset = file.seek(SeekFrom::End(0)).map_err(|_| FsError::Error)?;
    file.write_all(buf).map_err(|_| FsError::Error)?;
    Ok(offset)
}

/// Clusters needed to cover `size` bytes, given the cluster geometry.
pub(crate) fn clusters_for_size(size: u64, cluster_size: u64, cluster_shift: u32) -> u64 {
    align_up(size, cluster_size) >> cluster_shift
}
