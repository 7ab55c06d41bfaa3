//! Read-only XDVDFS (XISO) image reader.
//!
//! XDVDFS lays every directory out as a binary tree of dirents packed into
//! 2048-byte sectors. The reader validates an image by its 20-byte magic at
//! sector 32, either at the start of the file (scrubbed rip) or past the
//! fixed video-partition offset (redump rip), and then serves lookups by
//! walking the tree with the Xbox case-insensitive comparison.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use xstor_common::str::XboxStr;

pub const SECTOR_SIZE: u64 = 2048;
pub const ROOT_DIR_SECTOR: u64 = 32;
/// Offset of the game partition inside a redump image.
pub const GAME_PARTITION_OFFSET: u64 = SECTOR_SIZE * ROOT_DIR_SECTOR * 6192;

const FILE_DIRECTORY: u8 = 0x10;
const MAGIC: [u8; 20] = *b"MICROSOFT*XBOX*MEDIA";

/// On-disk volume descriptor at sector 32 of the game partition.
#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct VolumeDescriptor {
    magic1: [u8; 20],
    root_dirent_first_sector: u32,
    root_dirent_file_size: u32,
    timestamp: i64,
    unused: [u8; 1992],
    magic2: [u8; 20],
}

/// Fixed-size head of an on-disk dirent; the name bytes follow it.
#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DirentHead {
    /// Dword offset of the left child on this directory level.
    left_idx: u16,
    /// Dword offset of the right child on this directory level.
    right_idx: u16,
    file_sector: u32,
    file_size: u32,
    attributes: u8,
    name_length: u8,
}

const DIRENT_HEAD_SIZE: usize = 14;
/// XDVDFS names are at most 255 bytes.
const MAX_NAME_LENGTH: usize = 255;

struct DirentNode {
    head: DirentHead,
    name: [u8; MAX_NAME_LENGTH],
}

impl DirentNode {
    fn name_bytes(&self) -> &[u8] {
        &self.name[..self.head.name_length as usize]
    }
}

/// Metadata of a file located inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub is_directory: bool,
    /// Absolute byte offset of the file data inside the image file.
    pub offset: u64,
    pub size: u32,
    pub timestamp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum XdvdfsError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the image carries no XDVDFS volume descriptor")]
    NotAnXiso,
}

/// An opened XISO image.
pub struct XdvdfsImage {
    file: File,
    /// Zero for a scrubbed image, [`GAME_PARTITION_OFFSET`] for a redump one.
    base_offset: u64,
    root_dirent_first_sector: u32,
    timestamp: i64,
}

impl XdvdfsImage {
    /// Opens and validates an image, probing the scrubbed layout first and
    /// the redump layout second.
    pub fn open(path: &Path) -> Result<Self, XdvdfsError> {
        let mut file = File::open(path)?;
        for (base_offset, flavor) in [(0, "scrubbed"), (GAME_PARTITION_OFFSET, "redump")] {
            if let Some(desc) = Self::read_descriptor(&mut file, base_offset)? {
                log::info!("Detected {flavor} xiso file");
                return Ok(Self {
                    file,
                    base_offset,
                    root_dirent_first_sector: desc.root_dirent_first_sector,
                    timestamp: desc.timestamp,
                });
            }
        }
        Err(XdvdfsError::NotAnXiso)
    }

    fn read_descriptor(
        file: &mut File,
        base_offset: u64,
    ) -> Result<Option<VolumeDescriptor>, XdvdfsError> {
        let mut raw = [0u8; SECTOR_SIZE as usize];
        if file.seek(SeekFrom::Start(SECTOR_SIZE * ROOT_DIR_SECTOR + base_offset)).is_err()
            || file.read_exact(&mut raw).is_err()
        {
            return Ok(None);
        }
        let desc: VolumeDescriptor = *bytemuck::from_bytes(&raw);
        let valid = desc.magic1 == MAGIC
            && desc.magic2 == MAGIC
            && desc.root_dirent_first_sector != 0
            && desc.root_dirent_file_size != 0;
        Ok(valid.then_some(desc))
    }

    /// Reads one dirent node of the directory whose data starts at `sector`,
    /// at byte position `offset` inside it. Returns `None` when the node
    /// cannot be read; lookups treat that the same as a missing file.
    fn read_dirent(&mut self, sector: u64, offset: u64) -> Option<DirentNode> {
        let mut raw = [0u8; DIRENT_HEAD_SIZE + MAX_NAME_LENGTH];
        let position = SECTOR_SIZE * sector + self.base_offset + offset;
        if self.file.seek(SeekFrom::Start(position)).is_err() {
            return None;
        }
        // Short reads at the end of the image are fine as long as the head
        // and the name itself are present.
        let mut filled = 0;
        while filled < raw.len() {
            match self.file.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(_) => return None,
            }
        }
        if filled < DIRENT_HEAD_SIZE {
            return None;
        }
        let head: DirentHead = *bytemuck::from_bytes(&raw[..DIRENT_HEAD_SIZE]);
        if filled < DIRENT_HEAD_SIZE + head.name_length as usize {
            return None;
        }
        let mut name = [0u8; MAX_NAME_LENGTH];
        name[..head.name_length as usize]
            .copy_from_slice(&raw[DIRENT_HEAD_SIZE..DIRENT_HEAD_SIZE + head.name_length as usize]);
        Some(DirentNode { head, name })
    }

    /// Looks up `path` (segments separated by `/`) in the image.
    ///
    /// The empty path opens the root directory of the DVD.
    pub fn search_file(&mut self, path: &str) -> Option<FileInfo> {
        if path.is_empty() {
            return Some(FileInfo {
                is_directory: true,
                offset: self.base_offset,
                size: 0,
                timestamp: self.timestamp,
            });
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut seg_idx = 0;
        let mut curr_sector = self.root_dirent_first_sector as u64;
        let mut offset = 0u64;

        loop {
            let node = self.read_dirent(curr_sector, offset)?;
            let segment = XboxStr::from_str(segments[seg_idx]);
            match segment.compare(node.name_bytes()) {
                ord @ (Ordering::Less | Ordering::Greater) => {
                    let idx = if ord == Ordering::Less {
                        node.head.left_idx
                    } else {
                        node.head.right_idx
                    };
                    let new_offset = (idx as u64) << 2;
                    // Zero means the bottom of the tree; a non-increasing
                    // offset would loop forever.
                    if new_offset == 0 || new_offset <= offset {
                        return None;
                    }
                    offset = new_offset;
                }
                Ordering::Equal => {
                    seg_idx += 1;
                    if seg_idx == segments.len() {
                        return Some(FileInfo {
                            is_directory: node.head.attributes & FILE_DIRECTORY != 0,
                            offset: node.head.file_sector as u64 * SECTOR_SIZE
                                + self.base_offset,
                            size: node.head.file_size,
                            timestamp: self.timestamp,
                        });
                    }
                    // Some path remains: only a directory can be descended.
                    if node.head.attributes & FILE_DIRECTORY == 0 {
                        return None;
                    }
                    curr_sector = node.head.file_sector as u64;
                    offset = 0;
                }
            }
        }
    }

    /// Reads raw image bytes at an absolute offset; used to serve guest
    /// reads on files located by [`Self::search_file`].
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<VolumeDescriptor>(), 2048);
    const_assert_eq!(size_of::<DirentHead>(), DIRENT_HEAD_SIZE);

    fn poke(file: &mut File, at: u64, bytes: &[u8]) {
        use std::io::{Seek, SeekFrom, Write};
        file.seek(SeekFrom::Start(at)).unwrap();
        file.write_all(bytes).unwrap();
    }

    fn write_descriptor(file: &mut File, base: u64, root_sector: u32) {
        let desc = VolumeDescriptor {
            magic1: MAGIC,
            root_dirent_first_sector: root_sector,
            root_dirent_file_size: SECTOR_SIZE as u32,
            timestamp: 0x0123_4567_89AB_CDEF,
            unused: [0; 1992],
            magic2: MAGIC,
        };
        poke(file, base + SECTOR_SIZE * ROOT_DIR_SECTOR, bytemuck::bytes_of(&desc));
    }

    fn write_dirent(
        file: &mut File,
        base: u64,
        sector: u64,
        dword_offset: u16,
        left: u16,
        right: u16,
        file_sector: u32,
        file_size: u32,
        attributes: u8,
        name: &str,
    ) {
        let head = DirentHead {
            left_idx: left,
            right_idx: right,
            file_sector,
            file_size,
            attributes,
            name_length: name.len() as u8,
        };
        let at = base + SECTOR_SIZE * sector + dword_offset as u64 * 4;
        let mut raw = bytemuck::bytes_of(&head).to_vec();
        raw.extend_from_slice(name.as_bytes());
        poke(file, at, &raw);
    }

    /// Root tree: "game.xbe" at the root node, "a.bin" to its left, the
    /// "media" directory to its right; "clip.xmv" inside "media". The file
    /// is written sparsely so the redump layout stays cheap.
    fn build_image(base: u64) -> (XdvdfsImage, tempfile::NamedTempFile) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let file = tmp.as_file_mut();
            write_descriptor(file, base, 33);
            write_dirent(file, base, 33, 0, 8, 16, 40, 1234, 0, "game.xbe");
            write_dirent(file, base, 33, 8, 0, 0, 41, 16, 0, "a.bin");
            write_dirent(file, base, 33, 16, 0, 0, 34, 2048, FILE_DIRECTORY, "media");
            write_dirent(file, base, 34, 0, 0, 0, 42, 99, 0, "clip.xmv");
            file.set_len(base + SECTOR_SIZE * 35).unwrap();
            file.flush().unwrap();
        }
        let opened = XdvdfsImage::open(tmp.path()).unwrap();
        (opened, tmp)
    }

    #[test]
    fn rejects_an_image_without_magic() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 128 * 1024]).unwrap();
        assert!(matches!(
            XdvdfsImage::open(tmp.path()),
            Err(XdvdfsError::NotAnXiso)
        ));
    }

    #[test]
    fn detects_scrubbed_and_redump_layouts() {
        let (scrubbed, _guard) = build_image(0);
        assert_eq!(scrubbed.base_offset, 0);

        let (redump, _guard) = build_image(GAME_PARTITION_OFFSET);
        assert_eq!(redump.base_offset, GAME_PARTITION_OFFSET);
    }

    #[test]
    fn empty_path_opens_the_root() {
        let (mut image, _guard) = build_image(0);
        let info = image.search_file("").unwrap();
        assert!(info.is_directory);
        assert_eq!(info.offset, 0);
    }

    #[test]
    fn tree_walk_finds_files_case_insensitively() {
        let (mut image, _guard) = build_image(0);

        let info = image.search_file("game.xbe").unwrap();
        assert_eq!(info.size, 1234);
        assert_eq!(info.offset, 40 * SECTOR_SIZE);
        assert!(!info.is_directory);

        let info = image.search_file("A.BIN").unwrap();
        assert_eq!(info.size, 16);

        let info = image.search_file("MEDIA/clip.xmv").unwrap();
        assert_eq!(info.size, 99);
        assert_eq!(info.offset, 42 * SECTOR_SIZE);

        assert!(image.search_file("media").unwrap().is_directory);
    }

    #[test]
    fn missing_names_and_file_descends_fail() {
        let (mut image, _guard) = build_image(0);
        assert_eq!(image.search_file("nope"), None);
        assert_eq!(image.search_file("zzzz"), None);
        // "a.bin" is a file, not a directory
        assert_eq!(image.search_file("a.bin/whatever"), None);
        assert_eq!(image.search_file("media/missing.xmv"), None);
    }

    #[test]
    fn redump_offsets_are_relative_to_the_game_partition() {
        let (mut image, _guard) = build_image(GAME_PARTITION_OFFSET);
        let info = image.search_file("game.xbe").unwrap();
        assert_eq!(info.offset, 40 * SECTOR_SIZE + GAME_PARTITION_OFFSET);
    }
}
