//! Dirent-level metadata operations: access checks, create, overwrite,
//! delete, and write-past-end cluster appends.
//!
//! These all run after a [`Partition::find_dirent`] for the same file and
//! consume the scanner scratch it left behind; the request queue serializes
//! the pair.

use xstor_common::util::align_up;

use crate::error::FsError;
use crate::fat::constants::FATX32_CLUSTER_FREE;
use crate::partition::{append, clusters_for_size, write_at, Partition};
use crate::structures::cluster_entry::CLUSTER_KIND_DIRECTORY;
use crate::structures::dirent::{Dirent, FileAttributes, DIRENT_DELETED, DIRENT_END2};

// Access masks defined by the Xbox kernel.
pub const FATX_VALID_DIRECTORY_ACCESS: u32 = 0x11F_01FF;
pub const FATX_VALID_FILE_ACCESS: u32 = 0x11F_01FF;
pub const FATX_ACCESS_IMPLIES_WRITE: u32 = 0x11F_01B9;

/// NtCreateFile create option: delete the file when the last handle closes.
pub const FATX_DELETE_ON_CLOSE: u32 = 0x1000;

bitflags::bitflags! {
    /// Caller requirements on the kind of object being opened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessCheckFlags: u32 {
        const MUST_BE_A_DIR = 1 << 0;
        const MUST_NOT_BE_A_DIR = 1 << 1;
    }
}

/// Verifies a guest open/create against the dirent attributes.
///
/// The read-only check lives here because the kernel upstream does not know
/// the attributes stored in the dirent.
pub fn check_file_access(
    desired_access: u32,
    create_options: u32,
    attributes: FileAttributes,
    is_create: bool,
    flags: AccessCheckFlags,
) -> Result<(), FsError> {
    let is_directory = attributes.contains(FileAttributes::DIRECTORY);
    if flags.contains(AccessCheckFlags::MUST_BE_A_DIR) && !is_directory {
        return Err(FsError::NotADirectory);
    }
    if flags.contains(AccessCheckFlags::MUST_NOT_BE_A_DIR) && is_directory {
        return Err(FsError::IsADirectory);
    }

    let valid_access = if is_directory {
        FATX_VALID_DIRECTORY_ACCESS
    } else {
        FATX_VALID_FILE_ACCESS
    };
    if desired_access & !valid_access != 0 {
        return Err(FsError::Failed);
    }

    if attributes.contains(FileAttributes::READ_ONLY) {
        if !is_create && desired_access & !FATX_ACCESS_IMPLIES_WRITE != 0 {
            return Err(FsError::Failed);
        }
        if create_options & FATX_DELETE_ON_CLOSE != 0 {
            return Err(FsError::CannotDelete);
        }
    }

    Ok(())
}

impl Partition {
    /// Writes a new dirent for a file or directory whose lookup just failed
    /// with `NameNotFound`. Allocates the file's clusters and, when the free
    /// slot sits on a cluster boundary, one extra cluster to extend the
    /// stream. The free-cluster count drops by the total allocation.
    pub fn create_dirent_for_file(
        &mut self,
        dirent: &mut Dirent,
        file_tail: &str,
    ) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        let bytes_in_cluster = self.cluster_size;
        let clusters_for_file = if dirent.is_directory() {
            1
        } else {
            clusters_for_size(dirent.size as u64, bytes_in_cluster, self.cluster_shift)
        };
        let clusters_for_stream = u64::from(self.scanner.last_free_dirent_is_on_boundary);

        // The failed lookup scanned the whole stream, so it must have seen at
        // least the end-of-stream marker, which is a usable slot.
        let dirent_slot = self.scanner.last_free_dirent_offset;
        if dirent_slot == 0 {
            self.set_corrupted();
            return Err(FsError::Corrupt);
        }

        if clusters_for_file == 0 && clusters_for_stream == 0 {
            // Empty file, free slot available: no clusters to allocate.
            dirent.first_cluster = FATX32_CLUSTER_FREE;
            return write_at(&mut self.file, dirent_slot, bytemuck::bytes_of(dirent));
        }

        if clusters_for_file > 0 {
            if self.cluster_free_num < clusters_for_file + clusters_for_stream {
                return Err(FsError::Full);
            }
            // The file and the stream extension belong to different chains,
            // so they are allocated separately.
            let chain = self.allocate_free_clusters(clusters_for_file)?;
            dirent.first_cluster = chain[0].0;
            if let Err(err) = write_at(&mut self.file, dirent_slot, bytemuck::bytes_of(dirent)) {
                self.set_corrupted();
                return Err(err);
            }
            if dirent.is_directory() {
                self.init_directory_cluster(chain[0].0)?;
            } else {
                self.table_update_file_chain(chain, file_tail, 0)?;
            }
            if clusters_for_stream > 0 {
                let extension = self.allocate_free_clusters(1)?;
                self.extend_dirent_stream(extension[0].0)?;
            }
            self.cluster_free_num -= clusters_for_file + clusters_for_stream;
            return Ok(());
        }

        // Empty file, but the stream has no room for the new dirent.
        if self.cluster_free_num == 0 {
            return Err(FsError::Full);
        }
        dirent.first_cluster = FATX32_CLUSTER_FREE;
        if let Err(err) = write_at(&mut self.file, dirent_slot, bytemuck::bytes_of(dirent)) {
            self.set_corrupted();
            return Err(err);
        }
        let extension = self.allocate_free_clusters(1)?;
        self.extend_dirent_stream(extension[0].0)?;
        self.cluster_free_num -= 1;
        Ok(())
    }

    /// Appends a fresh 0xFF-filled cluster to the blob for a new directory
    /// and indexes it as that directory's dirent stream.
    fn init_directory_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let fill = vec![DIRENT_END2; self.cluster_size as usize];
        let stream_offset = match append(&mut self.file, &fill) {
            Ok(offset) => offset,
            Err(err) => {
                self.set_corrupted();
                return Err(err);
            }
        };
        self.table_update_single(cluster, stream_offset, CLUSTER_KIND_DIRECTORY)?;
        self.metadata_file_size = stream_offset + self.cluster_size;
        Ok(())
    }

    /// Rewrites the dirent found by the last lookup, growing or shrinking
    /// the file's cluster chain when the size changed. A shrink to zero
    /// releases the whole chain and clears `first_cluster`.
    pub fn overwrite_dirent_for_file(
        &mut self,
        dirent: &mut Dirent,
        new_size: u32,
        file_tail: &str,
    ) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        let dirent_offset = self.scanner.last_found_dirent_offset;
        if dirent_offset == 0 {
            self.set_corrupted();
            return Err(FsError::Corrupt);
        }

        if !dirent.is_directory() && new_size != dirent.size {
            let new_cluster_num =
                clusters_for_size(new_size as u64, self.cluster_size, self.cluster_shift);
            let old_cluster_num =
                clusters_for_size(dirent.size as u64, self.cluster_size, self.cluster_shift);
            if new_size > dirent.size {
                let add = new_cluster_num - old_cluster_num;
                if add > 0 {
                    if dirent.first_cluster == FATX32_CLUSTER_FREE {
                        if self.cluster_free_num < add {
                            return Err(FsError::Full);
                        }
                        let chain = self.allocate_free_clusters(add)?;
                        dirent.first_cluster = chain[0].0;
                        self.table_update_file_chain(chain, file_tail, 0)?;
                        self.cluster_free_num -= add;
                    } else {
                        self.extend_cluster_chain(dirent.first_cluster, add, file_tail)?;
                    }
                }
                dirent.size = new_size;
            } else {
                if dirent.first_cluster != FATX32_CLUSTER_FREE {
                    let freed = self
                        .free_allocated_clusters(dirent.first_cluster, new_cluster_num as u32)?;
                    self.table_free_clusters(freed)?;
                }
                dirent.size = new_size;
                if new_size == 0 {
                    dirent.first_cluster = FATX32_CLUSTER_FREE;
                }
            }
        }

        if let Err(err) = write_at(&mut self.file, dirent_offset, bytemuck::bytes_of(dirent)) {
            self.set_corrupted();
            return Err(err);
        }
        Ok(())
    }

    /// Releases a file's chain and marks the dirent deleted. Directories
    /// must be empty. The deletion mark is in-memory only: the caller
    /// flushes it, and the kernel upstream prevents re-open races.
    pub fn delete_dirent_for_file(&mut self, dirent: &mut Dirent) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        if dirent.is_directory() && !self.is_dirent_stream_empty(dirent.first_cluster)? {
            return Err(FsError::NotEmpty);
        }

        if dirent.first_cluster != FATX32_CLUSTER_FREE {
            let freed = self.free_allocated_clusters(dirent.first_cluster, 0)?;
            self.table_free_clusters(freed)?;
        }

        dirent.name_length = DIRENT_DELETED;
        dirent.first_cluster = FATX32_CLUSTER_FREE;
        Ok(())
    }

    /// Grows a file's chain so that a write of `size` bytes at `offset`
    /// lands inside allocated clusters, assigning a first chain when the
    /// file was empty. The dirent size follows the new end of data.
    pub fn append_clusters_to_file(
        &mut self,
        dirent: &mut Dirent,
        offset: i64,
        size: u32,
        file_tail: &str,
    ) -> Result<(), FsError> {
        self.fail_if_corrupted()?;

        let file_new_size = offset as u64 + size as u64;
        let file_aligned_size = align_up(dirent.size as u64, self.cluster_size);
        if file_new_size <= file_aligned_size {
            return Ok(());
        }

        if dirent.first_cluster == FATX32_CLUSTER_FREE {
            // First write to an empty file.
            let needed = clusters_for_size(file_new_size, self.cluster_size, self.cluster_shift);
            if self.cluster_free_num < needed {
                return Err(FsError::Full);
            }
            let chain = self.allocate_free_clusters(needed)?;
            dirent.first_cluster = chain[0].0;
            self.table_update_file_chain(chain, file_tail, 0)?;
            self.cluster_free_num -= needed;
        } else {
            let needed = clusters_for_size(file_new_size, self.cluster_size, self.cluster_shift)
                - (file_aligned_size >> self.cluster_shift);
            self.extend_cluster_chain(dirent.first_cluster, needed, file_tail)?;
        }

        dirent.size = file_new_size as u32;
        Ok(())
    }

    /// Persists a dirent at the offset the scanner reported for it.
    pub fn flush_dirent_for_file(
        &mut self,
        dirent: &Dirent,
        dirent_offset: u64,
    ) -> Result<(), FsError> {
        if let Err(err) = write_at(&mut self.file, dirent_offset, bytemuck::bytes_of(dirent)) {
            self.set_corrupted();
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn directory_flag_mismatches() {
        assert_eq!(
            check_file_access(
                0,
                0,
                FileAttributes::empty(),
                false,
                AccessCheckFlags::MUST_BE_A_DIR
            ),
            Err(FsError::NotADirectory)
        );
        assert_eq!(
            check_file_access(
                0,
                0,
                FileAttributes::DIRECTORY,
                false,
                AccessCheckFlags::MUST_NOT_BE_A_DIR
            ),
            Err(FsError::IsADirectory)
        );
        assert_eq!(
            check_file_access(
                0,
                0,
                FileAttributes::DIRECTORY,
                false,
                AccessCheckFlags::MUST_BE_A_DIR
            ),
            Ok(())
        );
    }

    #[test]
    fn access_masks_bound_the_request() {
        assert_eq!(
            check_file_access(
                FATX_VALID_FILE_ACCESS,
                0,
                FileAttributes::empty(),
                false,
                AccessCheckFlags::empty()
            ),
            Ok(())
        );
        // Any bit outside the valid mask is refused.
        assert_eq!(
            check_file_access(
                FATX_VALID_FILE_ACCESS | 0x0020_0000,
                0,
                FileAttributes::empty(),
                false,
                AccessCheckFlags::empty()
            ),
            Err(FsError::Failed)
        );
    }

    #[test]
    fn read_only_files_refuse_writes_and_delete_on_close() {
        // 0x40 (FILE_WRITE_DATA-class bit) is valid but implies a write.
        let write_access = FATX_VALID_FILE_ACCESS & !FATX_ACCESS_IMPLIES_WRITE;
        assert_ne!(write_access, 0);
        assert_eq!(
            check_file_access(
                write_access,
                0,
                FileAttributes::READ_ONLY,
                false,
                AccessCheckFlags::empty()
            ),
            Err(FsError::Failed)
        );
        // The same mask is allowed while creating the file.
        assert_eq!(
            check_file_access(
                write_access,
                0,
                FileAttributes::READ_ONLY,
                true,
                AccessCheckFlags::empty()
            ),
            Ok(())
        );
        assert_eq!(
            check_file_access(
                0,
                FATX_DELETE_ON_CLOSE,
                FileAttributes::READ_ONLY,
                false,
                AccessCheckFlags::empty()
            ),
            Err(FsError::CannotDelete)
        );
        assert_eq!(
            check_file_access(
                0,
                FATX_DELETE_ON_CLOSE,
                FileAttributes::empty(),
                false,
                AccessCheckFlags::empty()
            ),
            Ok(())
        );
    }
}

