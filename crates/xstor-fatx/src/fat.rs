//! FATX cluster chain arithmetic.
//!
//! FATX16 and FATX32 differ only in entry width and sentinel encoding:
//! 16-bit entries at or above the 0xFFF0 boundary are sign-extended to 32
//! bits, after which both variants use the same sentinel values. That is
//! the only normalization the engine performs.
//!
//! All FAT walks go through a [`FatPager`], a 4096-byte window over the FAT
//! region of the partition blob that flushes dirty pages when the walk
//! crosses a page boundary.

use std::fs::File;

use crate::error::FsError;
use crate::partition::{read_at, write_at, Partition};
use crate::structures::METADATA_FAT_OFFSET;

pub mod constants {
    pub const FATX16_BOUNDARY: u16 = 0xFFF0;
    pub const FATX16_CLUSTER_FREE: u16 = 0x0000;
    pub const FATX16_CLUSTER_ROOT: u16 = 0xFFF8;
    pub const FATX16_CLUSTER_EOC: u16 = 0xFFFF;

    pub const FATX32_CLUSTER_FREE: u32 = 0x0000_0000;
    pub const FATX32_CLUSTER_ROOT: u32 = 0xFFFF_FFF8;
    pub const FATX32_CLUSTER_EOC: u32 = 0xFFFF_FFFF;
}

use constants::*;

/// FAT entry width of a partition. Partitions 2..=5 hold at most 1 GiB and
/// are FATX16; everything else is FATX32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fatx16,
    Fatx32,
}

impl FatKind {
    pub fn for_partition(num: usize) -> Self {
        if (2..=5).contains(&num) { FatKind::Fatx16 } else { FatKind::Fatx32 }
    }

    pub fn entry_size(self) -> u64 {
        match self {
            FatKind::Fatx16 => 2,
            FatKind::Fatx32 => 4,
        }
    }

    /// Reads one entry from the start of `bytes`, normalized to 32 bits.
    pub fn decode(self, bytes: &[u8]) -> u32 {
        match self {
            FatKind::Fatx16 => {
                let entry = u16::from_le_bytes([bytes[0], bytes[1]]);
                if entry < FATX16_BOUNDARY {
                    entry as u32
                } else {
                    entry as i16 as u32
                }
            }
            FatKind::Fatx32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Writes one entry at the start of `bytes`, truncating normalized
    /// sentinels back to 16 bits where needed.
    pub fn encode(self, value: u32, bytes: &mut [u8]) {
        match self {
            FatKind::Fatx16 => bytes[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            FatKind::Fatx32 => bytes[..4].copy_from_slice(&value.to_le_bytes()),
        }
    }
}

const FAT_PAGE_SIZE: usize = 4096;

/// Buffered window over the FAT region of a partition blob.
pub(crate) struct FatPager<'a> {
    file: &'a mut File,
    kind: FatKind,
    page: Box<[u8; FAT_PAGE_SIZE]>,
    /// Offset of the loaded page inside the FAT region, `u64::MAX` if none.
    page_off: u64,
    dirty: bool,
}

impl<'a> FatPager<'a> {
    pub(crate) fn new(file: &'a mut File, kind: FatKind) -> Self {
        Self {
            file,
            kind,
            page: Box::new([0; FAT_PAGE_SIZE]),
            page_off: u64::MAX,
            dirty: false,
        }
    }

    fn entry_offset(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 1);
        (cluster as u64 - 1) * self.kind.entry_size()
    }

    fn load_for(&mut self, cluster: u32) -> Result<usize, FsError> {
        let offset = self.entry_offset(cluster);
        let page_off = offset & !(FAT_PAGE_SIZE as u64 - 1);
        if page_off != self.page_off {
            self.flush()?;
            read_at(self.file, METADATA_FAT_OFFSET + page_off, &mut self.page[..])?;
            self.page_off = page_off;
        }
        Ok((offset - page_off) as usize)
    }

    /// Normalized FAT entry for `cluster`.
    pub(crate) fn entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let at = self.load_for(cluster)?;
        Ok(self.kind.decode(&self.page[at..]))
    }

    pub(crate) fn set_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        let at = self.load_for(cluster)?;
        self.kind.encode(value, &mut self.page[at..]);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<(), FsError> {
        if self.dirty {
            write_at(self.file, METADATA_FAT_OFFSET + self.page_off, &self.page[..])?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Scan body of [`Partition::allocate_free_clusters`]; returns the chain in
/// discovery order plus the cluster the scan stopped at.
fn allocate_scan(
    pager: &mut FatPager,
    start: u32,
    total: u32,
    needed: u64,
) -> Result<Vec<(u32, u32)>, FsError> {
    let mut found: Vec<(u32, u32)> = Vec::with_capacity(needed as usize);
    let mut prev: Option<u32> = None;

    for cluster in (start..=total).chain(1..start) {
        if pager.entry(cluster)? != FATX32_CLUSTER_FREE {
            continue;
        }
        if let Some(prev_cluster) = prev {
            pager.set_entry(prev_cluster, cluster)?;
        }
        found.push((cluster, found.len() as u32));
        prev = Some(cluster);
        if found.len() as u64 == needed {
            pager.set_entry(cluster, FATX32_CLUSTER_EOC)?;
            pager.flush()?;
            return Ok(found);
        }
    }

    // Unreachable while the free-count precondition holds.
    Err(FsError::Full)
}

/// Walk body of [`Partition::free_allocated_clusters`].
fn truncate_chain(
    pager: &mut FatPager,
    start_cluster: u32,
    clusters_to_keep: u32,
    total: u64,
) -> Result<Vec<u32>, FsError> {
    let mut cursor = start_cluster;

    // Walk the kept prefix and terminate it.
    for i in 0..clusters_to_keep {
        let next = pager.entry(cursor)?;
        if i + 1 == clusters_to_keep {
            pager.set_entry(cursor, FATX32_CLUSTER_EOC)?;
        }
        if next == FATX32_CLUSTER_EOC {
            // Chain is no longer than the kept prefix: nothing to free.
            pager.flush()?;
            return Ok(Vec::new());
        }
        cursor = next;
    }

    // Free the rest of the chain.
    let mut freed = Vec::new();
    loop {
        if cursor == FATX32_CLUSTER_FREE || cursor as u64 - 1 >= total {
            return Err(FsError::Corrupt);
        }
        let next = pager.entry(cursor)?;
        pager.set_entry(cursor, FATX32_CLUSTER_FREE)?;
        freed.push(cursor);
        if next == FATX32_CLUSTER_EOC {
            pager.flush()?;
            return Ok(freed);
        }
        cursor = next;
    }
}

/// Walk body of the chain-tail search in [`Partition::extend_cluster_chain`];
/// returns the EOC cluster and the length of the existing chain.
fn find_chain_tail(
    pager: &mut FatPager,
    start_cluster: u32,
    total: u64,
) -> Result<(u32, u64), FsError> {
    let mut cursor = start_cluster;
    let mut chain_len: u64 = 1;
    loop {
        let entry = pager.entry(cursor)?;
        if entry == FATX32_CLUSTER_EOC {
            return Ok((cursor, chain_len));
        }
        if entry == FATX32_CLUSTER_FREE || entry as u64 - 1 >= total || chain_len > total {
            return Err(FsError::Corrupt);
        }
        cursor = entry;
        chain_len += 1;
    }
}

impl Partition {
    /// Single normalized FAT entry read, used by the dirent scanner when it
    /// follows a stream chain.
    pub(crate) fn read_fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let kind = self.fat_kind();
        let mut bytes = [0u8; 4];
        let offset = (cluster as u64 - 1) * kind.entry_size();
        read_at(
            &mut self.file,
            METADATA_FAT_OFFSET + offset,
            &mut bytes[..kind.entry_size() as usize],
        )?;
        Ok(kind.decode(&bytes))
    }

    /// Counts the FREE entries of clusters 1..=cluster_tot_num. Used at boot
    /// to recover the free-cluster count.
    pub(crate) fn count_free_clusters(&mut self) -> Result<u64, FsError> {
        let kind = self.fat_kind();
        let total = self.cluster_tot_num as u32;
        let mut pager = FatPager::new(&mut self.file, kind);
        let mut free = 0u64;
        for cluster in 1..=total {
            if pager.entry(cluster)? == FATX32_CLUSTER_FREE {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Scans the FAT for `needed` free clusters, chains them together and
    /// terminates the new chain with EOC. The scan starts at the last
    /// allocated cluster and wraps around once; the caller must have checked
    /// `cluster_free_num` beforehand, so the wrap always terminates.
    ///
    /// Returns the `(cluster, chain_offset)` pairs in discovery order. Does
    /// not touch `cluster_free_num`; the caller accounts for the allocation.
    pub(crate) fn allocate_free_clusters(
        &mut self,
        needed: u64,
    ) -> Result<Vec<(u32, u32)>, FsError> {
        debug_assert!(self.cluster_free_num >= needed);
        debug_assert!(needed > 0);

        let total = self.cluster_tot_num as u32;
        let start = self.last_allocated_cluster.clamp(1, total);
        let kind = self.fat_kind();
        let result = {
            let mut pager = FatPager::new(&mut self.file, kind);
            allocate_scan(&mut pager, start, total, needed)
        };
        match result {
            Ok(found) => {
                self.last_allocated_cluster = found.last().unwrap().0;
                Ok(found)
            }
            Err(FsError::Full) => Err(FsError::Full),
            Err(err) => {
                self.set_corrupted();
                Err(err)
            }
        }
    }

    /// Truncates the chain starting at `start_cluster` down to
    /// `clusters_to_keep` clusters: the last kept entry is rewritten to EOC
    /// and every entry past it is rewritten to FREE. Returns the freed
    /// clusters and adds them back to the free pool.
    pub(crate) fn free_allocated_clusters(
        &mut self,
        start_cluster: u32,
        clusters_to_keep: u32,
    ) -> Result<Vec<u32>, FsError> {
        let total = self.cluster_tot_num;
        let kind = self.fat_kind();
        let result = {
            let mut pager = FatPager::new(&mut self.file, kind);
            truncate_chain(&mut pager, start_cluster, clusters_to_keep, total)
        };
        match result {
            Ok(freed) => {
                self.cluster_free_num += freed.len() as u64;
                Ok(freed)
            }
            Err(err) => {
                self.set_corrupted();
                Err(err)
            }
        }
    }

    /// Walks to the EOC of the chain starting at `start_cluster`, allocates
    /// `clusters_to_add` more clusters and links them in. Cluster table
    /// entries for the new clusters keep the chain position within the file.
    pub(crate) fn extend_cluster_chain(
        &mut self,
        start_cluster: u32,
        clusters_to_add: u64,
        file_tail: &str,
    ) -> Result<(), FsError> {
        if self.cluster_free_num < clusters_to_add {
            return Err(FsError::Full);
        }

        let total = self.cluster_tot_num;
        let kind = self.fat_kind();
        let result = {
            let mut pager = FatPager::new(&mut self.file, kind);
            find_chain_tail(&mut pager, start_cluster, total)
        };
        let (tail_cluster, old_cluster_num) = match result {
            Ok(tail) => tail,
            Err(err) => {
                self.set_corrupted();
                return Err(err);
            }
        };

        let found = self.allocate_free_clusters(clusters_to_add)?;

        // Replace the old EOC with the first new cluster.
        let relink = {
            let mut pager = FatPager::new(&mut self.file, kind);
            pager
                .set_entry(tail_cluster, found[0].0)
                .and_then(|()| pager.flush())
        };
        if let Err(err) = relink {
            self.set_corrupted();
            return Err(err);
        }

        self.table_update_file_chain(found, file_tail, old_cluster_num as u32)?;
        self.cluster_free_num -= clusters_to_add;
        Ok(())
    }
}
