//! Dirent stream scanning.
//!
//! A directory is a cluster-chained stream of 64-byte dirents. The scanner
//! walks the stream one cluster at a time, resolving each cluster through
//! the cluster table, and records scratch for the metadata operation that
//! follows: the first reusable slot it saw, the offset of the dirent it
//! found, and whether a create would have to extend the stream by one
//! cluster because the free slot sits in the last position of its cluster.

use xstor_common::str::XboxStr;

use crate::error::FsError;
use crate::cluster_table::ClusterInfo;
use crate::partition::{append, read_at, Partition};
use crate::structures::dirent::{Dirent, DIRENT_END2, DIRENT_SIZE, FATX_MAX_FILE_LENGTH};
use crate::fat::constants::{FATX32_CLUSTER_EOC, FATX32_CLUSTER_FREE};
use crate::structures::cluster_entry::CLUSTER_KIND_DIRECTORY;

/// A single dirent stream holds at most this many entries.
pub const FATX_MAX_NUM_DIRENT: u32 = 4096;

/// Successful outcome of a dirent lookup.
#[derive(Debug, Clone)]
pub enum FindResult {
    /// The final path segment resolved to this dirent, located at
    /// `dirent_offset` in the partition blob.
    Found { dirent: Dirent, dirent_offset: u64 },
    /// The path named the root directory of the partition.
    RootDir,
}

impl Partition {
    /// Locates the dirent for `remaining_path`, a path of the form
    /// `Harddisk/Partition<N>/<name>[/<name>...]`.
    ///
    /// On `NameNotFound` the scanner scratch identifies where a subsequent
    /// create must place the new dirent.
    pub fn find_dirent(&mut self, remaining_path: &str) -> Result<FindResult, FsError> {
        self.scanner.last_free_dirent_offset = 0;
        self.scanner.last_found_dirent_offset = 0;

        let root_str = format!("Harddisk/Partition{}/", self.num);
        if remaining_path == root_str {
            return Ok(FindResult::RootDir);
        }
        let relative = remaining_path
            .strip_prefix(root_str.as_str())
            .unwrap_or(remaining_path)
            .trim_end_matches('/');

        let segments: Vec<&str> = relative.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            return Ok(FindResult::RootDir);
        }

        let bytes_in_cluster = self.cluster_size as usize;
        let dirents_per_cluster = (self.cluster_size >> 6) as u32;
        let mut buffer = vec![0u8; bytes_in_cluster];
        let mut dirent_cluster: u32 = 1;
        self.scanner.last_dirent_stream_cluster = 1;
        let mut seg_idx = 0;
        let mut num_dirent: u32 = 0;
        let mut found_free_dirent = false;

        'stream: loop {
            if dirent_cluster == 0 || dirent_cluster as u64 - 1 >= self.cluster_tot_num {
                self.set_corrupted();
                return Err(FsError::Corrupt);
            }

            let stream_offset = match self.cluster_lookup(dirent_cluster)? {
                ClusterInfo::Directory { host_offset } if host_offset != 0 => host_offset,
                _ => {
                    log::error!(
                        "Dirent stream at cluster {dirent_cluster} was not found in Partition{}.bin",
                        self.num
                    );
                    return Err(FsError::Error);
                }
            };

            read_at(&mut self.file, stream_offset, &mut buffer)?;

            let segment = segments[seg_idx];
            let is_last_name = seg_idx + 1 == segments.len();
            let segment_name = XboxStr::from_str(segment);

            let mut offset_in_cluster = 0usize;
            let mut descended = false;
            while offset_in_cluster < bytes_in_cluster {
                if num_dirent == FATX_MAX_NUM_DIRENT {
                    self.set_corrupted();
                    return Err(FsError::Corrupt);
                }

                let dirent: Dirent = *bytemuck::from_bytes(
                    &buffer[offset_in_cluster..offset_in_cluster + DIRENT_SIZE],
                );
                if dirent.is_free() {
                    if !found_free_dirent {
                        self.scanner.last_free_dirent_offset =
                            stream_offset + offset_in_cluster as u64;
                        found_free_dirent = true;
                    }
                    if dirent.is_end_of_stream() {
                        // NOTE: clusters are not guaranteed to be aligned on a
                        // cluster boundary in the partition blob
                        let idx_in_cluster = (offset_in_cluster / DIRENT_SIZE) as u32;
                        self.scanner.last_free_dirent_is_on_boundary =
                            idx_in_cluster + 1 == dirents_per_cluster;
                        return Err(if is_last_name {
                            FsError::NameNotFound
                        } else {
                            FsError::PathNotFound
                        });
                    }
                    // Deleted entry: the slot is reusable but the stream
                    // continues past it.
                    num_dirent += 1;
                    offset_in_cluster += DIRENT_SIZE;
                    continue;
                }

                if dirent.name_length as usize == segment.len()
                    && dirent.name_length as usize <= FATX_MAX_FILE_LENGTH
                    && segment_name == XboxStr::new(dirent.name_bytes())
                {
                    if is_last_name {
                        let dirent_offset = stream_offset + offset_in_cluster as u64;
                        self.scanner.last_found_dirent_offset = dirent_offset;
                        self.scanner.last_dirent_stream_cluster = 0;
                        return Ok(FindResult::Found { dirent, dirent_offset });
                    }
                    if dirent.is_directory() {
                        seg_idx += 1;
                        dirent_cluster = dirent.first_cluster;
                        self.scanner.last_dirent_stream_cluster = dirent.first_cluster;
                        num_dirent = 0;
                        found_free_dirent = false;
                        descended = true;
                        break;
                    }
                    // A file with the same name as the directory we are
                    // looking for: keep scanning.
                }

                num_dirent += 1;
                offset_in_cluster += DIRENT_SIZE;
            }

            if descended {
                continue 'stream;
            }

            // Attempt to continue the search from a possibly chained stream.
            let next = self.read_fat_entry(dirent_cluster)?;
            if next == FATX32_CLUSTER_FREE {
                self.set_corrupted();
                return Err(FsError::Corrupt);
            }
            if next == FATX32_CLUSTER_EOC {
                self.scanner.last_free_dirent_is_on_boundary = false;
                return Err(if is_last_name {
                    FsError::NameNotFound
                } else {
                    FsError::PathNotFound
                });
            }
            dirent_cluster = next;
            self.scanner.last_dirent_stream_cluster = next;
        }
    }

    /// Walks the stream starting at `start_cluster` (or the root when zero)
    /// and reports whether it holds any live dirent. Reaching the end of the
    /// chain without one counts as empty.
    pub fn is_dirent_stream_empty(&mut self, start_cluster: u32) -> Result<bool, FsError> {
        let bytes_in_cluster = self.cluster_size as usize;
        let mut buffer = vec![0u8; bytes_in_cluster];
        let mut dirent_cluster = if start_cluster != 0 { start_cluster } else { 1 };
        let mut num_dirent: u32 = 0;

        loop {
            if dirent_cluster as u64 - 1 >= self.cluster_tot_num {
                self.set_corrupted();
                return Err(FsError::Corrupt);
            }
            let stream_offset = match self.cluster_lookup(dirent_cluster)? {
                ClusterInfo::Directory { host_offset } if host_offset != 0 => host_offset,
                _ => {
                    log::error!(
                        "Dirent stream at cluster {dirent_cluster} was not found in Partition{}.bin",
                        self.num
                    );
                    return Err(FsError::Error);
                }
            };
            read_at(&mut self.file, stream_offset, &mut buffer)?;

            for chunk in buffer.chunks_exact(DIRENT_SIZE) {
                if num_dirent == FATX_MAX_NUM_DIRENT {
                    self.set_corrupted();
                    return Err(FsError::Corrupt);
                }
                let dirent: Dirent = *bytemuck::from_bytes(chunk);
                if dirent.is_end_of_stream() {
                    return Ok(true);
                }
                if !dirent.is_deleted() {
                    // Found at least one valid dirent.
                    return Ok(false);
                }
                num_dirent += 1;
            }

            let next = self.read_fat_entry(dirent_cluster)?;
            if next == FATX32_CLUSTER_FREE {
                self.set_corrupted();
                return Err(FsError::Corrupt);
            }
            if next == FATX32_CLUSTER_EOC {
                return Ok(true);
            }
            dirent_cluster = next;
        }
    }

    /// Appends a fresh cluster of end-of-stream markers to the partition
    /// blob, chains it to the last cluster the scanner stopped at, and
    /// indexes it as a dirent stream cluster.
    pub(crate) fn extend_dirent_stream(&mut self, cluster: u32) -> Result<(), FsError> {
        debug_assert!(self.scanner.last_free_dirent_is_on_boundary);
        debug_assert!(self.scanner.last_dirent_stream_cluster != 0);

        let bytes_in_cluster = self.cluster_size as usize;
        let fill = vec![DIRENT_END2; bytes_in_cluster];
        let stream_offset = append(&mut self.file, &fill)?;

        let kind = self.fat_kind();
        let relink = {
            let mut pager = crate::fat::FatPager::new(&mut self.file, kind);
            pager
                .set_entry(self.scanner.last_dirent_stream_cluster, cluster)
                .and_then(|()| pager.flush())
        };
        if let Err(err) = relink {
            self.set_corrupted();
            return Err(err);
        }

        self.table_update_single(cluster, stream_offset, CLUSTER_KIND_DIRECTORY)?;
        self.metadata_file_size = stream_offset + bytes_in_cluster as u64;

        Ok(())
    }
}
