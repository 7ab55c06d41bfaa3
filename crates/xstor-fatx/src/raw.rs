//! Cluster-aware raw partition reads and writes.
//!
//! Partition 0 is a plain file, so raw access is a straight seek. On FATX
//! partitions, offsets inside the superblock/FAT region map directly into
//! the blob (shifted past the user data area), and everything else is split
//! into cluster units served through the cluster table: freed clusters read
//! as zeros and materialize as raw clusters on write, directory and raw
//! clusters live in the blob, file clusters live in the per-file host files.
//!
//! A write that lands inside the superblock range reformats the partition
//! with the just-written bytes as the new superblock template; the FATX
//! signature is deliberately not checked first.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use xstor_common::util::in_range;

use crate::cluster_table::ClusterInfo;
use crate::error::FsError;
use crate::partition::{append, read_at, write_at, Partition, PartitionManager};
use crate::structures::cluster_entry::CLUSTER_KIND_RAW;
use crate::structures::partition_table::PartitionTable;
use crate::structures::superblock::SUPERBLOCK_SIZE;
use crate::structures::user_data::USER_DATA_AREA_SIZE;
use crate::structures::CONFIG_AREA_SIZE;

impl PartitionManager {
    /// Raw read at a partition-relative offset.
    pub fn read_raw_partition(
        &mut self,
        partition_num: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        if partition_num == 0 {
            if offset + buf.len() as u64 > CONFIG_AREA_SIZE {
                return Err(FsError::Error);
            }
            return read_at(&mut self.config, offset, buf);
        }
        self.partition(partition_num)?.read_raw(offset, buf)
    }

    /// Raw write at a partition-relative offset.
    ///
    /// Writes into partition 0's table range refresh the in-memory partition
    /// table snapshot; writes into a FATX partition's superblock range
    /// reformat that partition around the written bytes.
    pub fn write_raw_partition(
        &mut self,
        partition_num: usize,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), FsError> {
        if partition_num == 0 {
            if offset + buf.len() as u64 > CONFIG_AREA_SIZE {
                return Err(FsError::Error);
            }
            write_at(&mut self.config, offset, buf)?;
            if in_range(offset, 0, size_of::<PartitionTable>() as u64 - 1) {
                // The guest rewrote the partition table. Reload our snapshot;
                // the homebrew is expected to reformat the partitions itself.
                self.reload_partition_table()?;
            }
            return Ok(());
        }

        self.partition(partition_num)?.write_raw_clusters(offset, buf)?;

        if in_range(offset, 0, SUPERBLOCK_SIZE as u64 - 1) {
            // The guest rewrote the superblock: reformat this partition with
            // the written bytes as the template.
            self.reload_partition_table()?;
            let partition_len = self
                .table
                .entry_for_partition(partition_num)
                .filter(|e| e.size_bytes() != 0)
                .map(|e| e.size_bytes())
                .ok_or(FsError::Error)?;
            let mut template = [0u8; SUPERBLOCK_SIZE];
            let copy_len = buf.len().min(SUPERBLOCK_SIZE - offset as usize);
            template[offset as usize..offset as usize + copy_len]
                .copy_from_slice(&buf[..copy_len]);
            self.partition(partition_num)?
                .format_with_superblock(&template, partition_len)?;
        }

        Ok(())
    }
}

impl Partition {
    pub(crate) fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        // Superblock and FAT reads bypass the cluster map.
        if offset < SUPERBLOCK_SIZE as u64 + self.metadata_fat_size {
            return read_at(&mut self.file, offset + USER_DATA_AREA_SIZE as u64, buf);
        }

        let cluster_mask = self.cluster_size - 1;
        let mut cluster = (offset >> self.cluster_shift) as u32;
        let mut intra = offset & cluster_mask;
        let mut pos = 0usize;

        while pos < buf.len() {
            let chunk = (buf.len() - pos).min((self.cluster_size - intra) as usize);
            match self.cluster_lookup(cluster)? {
                ClusterInfo::Freed => buf[pos..pos + chunk].fill(0),
                ClusterInfo::Directory { host_offset } | ClusterInfo::Raw { host_offset } => {
                    read_at(&mut self.file, host_offset + intra, &mut buf[pos..pos + chunk])?;
                }
                ClusterInfo::File { chain_index, relative_path } => {
                    let path = self.base_dir.join(relative_path);
                    let mut file = OpenOptions::new()
                        .read(true)
                        .open(&path)
                        .map_err(|_| FsError::Error)?;
                    let file_offset = ((chain_index as u64) << self.cluster_shift) + intra;
                    file.seek(SeekFrom::Start(file_offset)).map_err(|_| FsError::Error)?;
                    // The host file may be shorter than the cluster span;
                    // reads past its end yield zeros.
                    let mut read = 0usize;
                    while read < chunk {
                        match file.read(&mut buf[pos + read..pos + chunk]) {
                            Ok(0) => break,
                            Ok(n) => read += n,
                            Err(_) => return Err(FsError::Error),
                        }
                    }
                    buf[pos + read..pos + chunk].fill(0);
                }
            }
            pos += chunk;
            intra = 0;
            cluster += 1;
        }

        Ok(())
    }

    pub(crate) fn write_raw_clusters(&mut self, offset: u64, buf: &[u8]) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        let cluster_mask = self.cluster_size - 1;
        let mut cluster = (offset >> self.cluster_shift) as u32;
        let mut intra = offset & cluster_mask;
        let mut pos = 0usize;

        while pos < buf.len() {
            let chunk = (buf.len() - pos).min((self.cluster_size - intra) as usize);
            match self.cluster_lookup(cluster)? {
                ClusterInfo::Freed => {
                    // Materialize the cluster at the end of the blob, with
                    // the written bytes placed at their intra-cluster offset.
                    let mut cluster_buf = vec![0u8; self.cluster_size as usize];
                    cluster_buf[intra as usize..intra as usize + chunk]
                        .copy_from_slice(&buf[pos..pos + chunk]);
                    let host_offset = append(&mut self.file, &cluster_buf)?;
                    self.table_update_single(cluster, host_offset, CLUSTER_KIND_RAW)?;
                    self.metadata_file_size = host_offset + self.cluster_size;
                }
                ClusterInfo::Directory { host_offset } | ClusterInfo::Raw { host_offset } => {
                    write_at(&mut self.file, host_offset + intra, &buf[pos..pos + chunk])?;
                }
                ClusterInfo::File { chain_index, relative_path } => {
                    let path = self.base_dir.join(relative_path);
                    let mut file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&path)
                        .map_err(|_| FsError::Error)?;
                    let file_offset = ((chain_index as u64) << self.cluster_shift) + intra;
                    file.seek(SeekFrom::Start(file_offset)).map_err(|_| FsError::Error)?;
                    file.write_all(&buf[pos..pos + chunk]).map_err(|_| FsError::Error)?;
                }
            }
            pos += chunk;
            intra = 0;
            cluster += 1;
        }

        Ok(())
    }
}
