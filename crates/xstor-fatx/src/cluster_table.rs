//! The per-partition cluster index.
//!
//! `ClusterTable<N>.bin` maps every FAT cluster onto its host storage. The
//! file is an array of 16-byte [`ClusterDataEntry`] records, grown and
//! rewritten in 4096-byte elements, with an in-memory cache in front of it.
//! Any host I/O failure on this path marks the partition corrupted and the
//! corruption is sticky until the next boot reformats the partition.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use crate::error::FsError;
use crate::partition::{append, create_file, open_file, read_at, write_at, Partition};
use crate::structures::cluster_entry::{
    cluster_table_offset, ClusterDataEntry, CLUSTER_DATA_ENTRY_SIZE, CLUSTER_KIND_DIRECTORY,
    CLUSTER_KIND_FILE, CLUSTER_KIND_FREED, CLUSTER_KIND_RAW, CLUSTER_TABLE_ELEM_SIZE,
};

/// Where a cluster's bytes live, decoded from its table entry. The stored
/// path is only meaningful for file clusters, which the sum type makes
/// unrepresentable for the other kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterInfo {
    /// Not in use.
    Freed,
    /// The cluster belongs to a file stored as a real host file.
    File {
        /// Ordinal of this cluster within the file's chain.
        chain_index: u32,
        /// Path of the host file, relative to the emulator root.
        relative_path: PathBuf,
    },
    /// A dirent stream cluster inside the partition blob.
    Directory { host_offset: u64 },
    /// A raw cluster inside the partition blob.
    Raw { host_offset: u64 },
}

pub(crate) struct ClusterTable {
    file: File,
    path: PathBuf,
    file_size: u64,
    cache: HashMap<u32, ClusterInfo>,
}

impl ClusterTable {
    pub(crate) fn create(path: PathBuf) -> Result<Self, std::io::Error> {
        let file = create_file(&path)?;
        Ok(Self { file, path, file_size: 0, cache: HashMap::new() })
    }

    pub(crate) fn open(path: PathBuf) -> Result<Self, std::io::Error> {
        let file = open_file(&path)?;
        let file_size = file.metadata()?.len();
        Ok(Self { file, path, file_size, cache: HashMap::new() })
    }

    /// Empties the table and writes a single element with cluster 1 indexed
    /// as the root dirent stream at `root_offset`.
    pub(crate) fn reset_with_root(&mut self, root_offset: u64) -> Result<(), std::io::Error> {
        self.file.set_len(0)?;
        self.cache.clear();
        let mut elem = [0u8; CLUSTER_TABLE_ELEM_SIZE];
        let root = ClusterDataEntry {
            kind: CLUSTER_KIND_DIRECTORY,
            size: 0,
            info: 0,
            offset: root_offset,
        };
        elem[CLUSTER_DATA_ENTRY_SIZE..2 * CLUSTER_DATA_ENTRY_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&root));
        write_at(&mut self.file, 0, &elem).map_err(std::io::Error::other)?;
        self.file_size = CLUSTER_TABLE_ELEM_SIZE as u64;
        Ok(())
    }

    /// Grows the table file so it covers `highest_cluster`, rounding the new
    /// length up to the element size.
    fn ensure_covers(&mut self, highest_cluster: u32) -> Result<(), FsError> {
        let needed = xstor_common::util::align_up(
            (highest_cluster as u64 + 1) * CLUSTER_DATA_ENTRY_SIZE as u64,
            CLUSTER_TABLE_ELEM_SIZE as u64,
        );
        if needed > self.file_size {
            self.file.set_len(needed).map_err(|err| {
                log::error!("Failed to resize {}: {err}", self.path.display());
                FsError::Error
            })?;
            self.file_size = needed;
        }
        Ok(())
    }

    /// Looks up one cluster. Consults the cache first; on a miss the element
    /// containing the entry is read and the decoded entry cached. A cluster
    /// past the end of the table file was never allocated and reports as
    /// freed without being cached.
    pub(crate) fn lookup(&mut self, cluster: u32, blob: &mut File) -> Result<ClusterInfo, FsError> {
        if let Some(info) = self.cache.get(&cluster) {
            return Ok(info.clone());
        }

        let entry_offset = cluster_table_offset(cluster);
        if entry_offset + CLUSTER_DATA_ENTRY_SIZE as u64 > self.file_size {
            return Ok(ClusterInfo::Freed);
        }

        let elem_offset = entry_offset & !(CLUSTER_TABLE_ELEM_SIZE as u64 - 1);
        let mut elem = [0u8; CLUSTER_TABLE_ELEM_SIZE];
        read_at(&mut self.file, elem_offset, &mut elem).inspect_err(|_| {
            log::error!("Failed to read {}", self.path.display());
        })?;
        let at = (entry_offset - elem_offset) as usize;
        let entry: ClusterDataEntry =
            *bytemuck::from_bytes(&elem[at..at + CLUSTER_DATA_ENTRY_SIZE]);

        let info = match entry.kind {
            CLUSTER_KIND_FREED => ClusterInfo::Freed,
            CLUSTER_KIND_FILE => {
                let mut path = vec![0u8; entry.size as usize];
                read_at(blob, entry.offset, &mut path).inspect_err(|_| {
                    log::error!("Failed to read the stored path of cluster {cluster}");
                })?;
                let path = String::from_utf8(path).map_err(|_| FsError::Corrupt)?;
                ClusterInfo::File { chain_index: entry.info, relative_path: PathBuf::from(path) }
            }
            CLUSTER_KIND_DIRECTORY => ClusterInfo::Directory { host_offset: entry.offset },
            CLUSTER_KIND_RAW => ClusterInfo::Raw { host_offset: entry.offset },
            _ => return Err(FsError::Corrupt),
        };
        self.cache.insert(cluster, info.clone());
        Ok(info)
    }

    /// Indexes a cluster chain belonging to one file. The file's stored path
    /// is appended to the partition blob once, and the table is rewritten one
    /// element at a time, walking only as many elements as the sorted chain
    /// crosses. Each entry keeps the cluster's position within the file,
    /// `chain_offset + chain_base`.
    pub(crate) fn update_file_chain(
        &mut self,
        mut clusters: Vec<(u32, u32)>,
        stored_path: &str,
        chain_base: u32,
        blob: &mut File,
        blob_size: &mut u64,
    ) -> Result<(), FsError> {
        debug_assert!(!clusters.is_empty());
        debug_assert!(stored_path.len() <= u16::MAX as usize);

        clusters.sort_unstable_by_key(|&(cluster, _)| cluster);
        let highest = clusters.last().unwrap().0;
        self.ensure_covers(highest)?;

        let path_offset = append(blob, stored_path.as_bytes())?;
        *blob_size = path_offset + stored_path.len() as u64;

        let mut entry = ClusterDataEntry {
            kind: CLUSTER_KIND_FILE,
            size: stored_path.len() as u16,
            info: 0,
            offset: path_offset,
        };

        let mut elem = [0u8; CLUSTER_TABLE_ELEM_SIZE];
        let mut elem_offset = cluster_table_offset(clusters[0].0) & !(CLUSTER_TABLE_ELEM_SIZE as u64 - 1);
        self.read_elem(elem_offset, &mut elem)?;
        for &(cluster, chain_offset) in &clusters {
            let entry_offset = cluster_table_offset(cluster);
            let wanted = entry_offset & !(CLUSTER_TABLE_ELEM_SIZE as u64 - 1);
            if wanted != elem_offset {
                self.write_elem(elem_offset, &elem)?;
                elem_offset = wanted;
                self.read_elem(elem_offset, &mut elem)?;
            }
            entry.info = chain_offset + chain_base;
            let at = (entry_offset - elem_offset) as usize;
            elem[at..at + CLUSTER_DATA_ENTRY_SIZE].copy_from_slice(bytemuck::bytes_of(&entry));
            self.cache.remove(&cluster);
        }
        self.write_elem(elem_offset, &elem)?;

        Ok(())
    }

    /// Indexes a single dirent-stream or raw cluster; no path is stored.
    pub(crate) fn update_single(
        &mut self,
        cluster: u32,
        host_offset: u64,
        kind: u16,
    ) -> Result<(), FsError> {
        debug_assert!(kind == CLUSTER_KIND_DIRECTORY || kind == CLUSTER_KIND_RAW);
        self.ensure_covers(cluster)?;
        let entry = ClusterDataEntry { kind, size: 0, info: 0, offset: host_offset };
        write_at(
            &mut self.file,
            cluster_table_offset(cluster),
            bytemuck::bytes_of(&entry),
        )
        .inspect_err(|_| log::error!("Failed to write {}", self.path.display()))?;
        self.cache.remove(&cluster);
        Ok(())
    }

    /// Rewrites the touched elements with freed entries and drops the
    /// clusters from the cache.
    pub(crate) fn free_clusters(&mut self, mut clusters: Vec<u32>) -> Result<(), FsError> {
        debug_assert!(!clusters.is_empty());
        clusters.sort_unstable();
        debug_assert!(
            (*clusters.last().unwrap() as u64 + 1) * CLUSTER_DATA_ENTRY_SIZE as u64
                <= self.file_size
        );

        let mut elem = [0u8; CLUSTER_TABLE_ELEM_SIZE];
        let mut elem_offset = cluster_table_offset(clusters[0]) & !(CLUSTER_TABLE_ELEM_SIZE as u64 - 1);
        self.read_elem(elem_offset, &mut elem)?;
        for &cluster in &clusters {
            let entry_offset = cluster_table_offset(cluster);
            let wanted = entry_offset & !(CLUSTER_TABLE_ELEM_SIZE as u64 - 1);
            if wanted != elem_offset {
                self.write_elem(elem_offset, &elem)?;
                elem_offset = wanted;
                self.read_elem(elem_offset, &mut elem)?;
            }
            let at = (entry_offset - elem_offset) as usize;
            elem[at..at + CLUSTER_DATA_ENTRY_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&ClusterDataEntry::freed()));
            self.cache.remove(&cluster);
        }
        self.write_elem(elem_offset, &elem)?;

        Ok(())
    }

    fn read_elem(&mut self, offset: u64, elem: &mut [u8; CLUSTER_TABLE_ELEM_SIZE]) -> Result<(), FsError> {
        read_at(&mut self.file, offset, elem)
            .inspect_err(|_| log::error!("Failed to read {}", self.path.display()))
    }

    fn write_elem(&mut self, offset: u64, elem: &[u8; CLUSTER_TABLE_ELEM_SIZE]) -> Result<(), FsError> {
        write_at(&mut self.file, offset, elem)
            .inspect_err(|_| log::error!("Failed to write {}", self.path.display()))
    }
}

impl Partition {
    /// Resolves a cluster to its host storage, marking the partition
    /// corrupted on any host I/O failure along the way.
    pub(crate) fn cluster_lookup(&mut self, cluster: u32) -> Result<ClusterInfo, FsError> {
        match self.table.lookup(cluster, &mut self.file) {
            Ok(info) => Ok(info),
            Err(err) => {
                self.set_corrupted();
                Err(err)
            }
        }
    }

    pub(crate) fn table_update_file_chain(
        &mut self,
        clusters: Vec<(u32, u32)>,
        file_tail: &str,
        chain_base: u32,
    ) -> Result<(), FsError> {
        let stored_path = self.stored_path_for(file_tail);
        let result = self.table.update_file_chain(
            clusters,
            &stored_path,
            chain_base,
            &mut self.file,
            &mut self.metadata_file_size,
        );
        if result.is_err() {
            self.set_corrupted();
        }
        result
    }

    pub(crate) fn table_update_single(
        &mut self,
        cluster: u32,
        host_offset: u64,
        kind: u16,
    ) -> Result<(), FsError> {
        let result = self.table.update_single(cluster, host_offset, kind);
        if result.is_err() {
            self.set_corrupted();
        }
        result
    }

    pub(crate) fn table_free_clusters(&mut self, clusters: Vec<u32>) -> Result<(), FsError> {
        if clusters.is_empty() {
            return Ok(());
        }
        let result = self.table.free_clusters(clusters);
        if result.is_err() {
            self.set_corrupted();
        }
        result
    }
}
