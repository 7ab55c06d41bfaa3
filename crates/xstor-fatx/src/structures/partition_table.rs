//! The Xbox partition table stored at the start of the configuration area.
//!
//! A stock console has no partition table at all; the fixed layout below is
//! the one homebrews write when they set up non-standard partitions, and it
//! mirrors the sizes reported by the xboxdevwiki. The engine keeps a live
//! snapshot of the table and refreshes it whenever the guest writes to the
//! table range of partition 0.

use super::{CONFIG_AREA_SIZE, HDD_SECTOR_SIZE};

pub const PARTITION_TABLE_MAGIC: [u8; 16] = *b"****PARTINFO****";

/// Bit 31 of the entry flags marks the entry as in use.
pub const PE_PARTFLAGS_IN_USE: u32 = 0x8000_0000;

// LBA start/size of the standard partitions, in 512-byte sectors.
const SWAPPART1_LBA_START: u32 = (0x0008_0000 / HDD_SECTOR_SIZE) as u32;
const SWAPPART2_LBA_START: u32 = (0x2ee8_0000 / HDD_SECTOR_SIZE) as u32;
const SWAPPART3_LBA_START: u32 = (0x5dc8_0000 / HDD_SECTOR_SIZE) as u32;
const SWAPPART_LBA_SIZE: u32 = (0x2ee0_0000 / HDD_SECTOR_SIZE) as u32;
const SYSPART_LBA_START: u32 = (0x8ca8_0000 / HDD_SECTOR_SIZE) as u32;
const SYSPART_LBA_SIZE: u32 = (0x1f40_0000 / HDD_SECTOR_SIZE) as u32;
const MUSICPART_LBA_START: u32 = (0xabe8_0000u64 / HDD_SECTOR_SIZE) as u32;
const MUSICPART_LBA_SIZE: u32 = (0x1_31f0_0000u64 / HDD_SECTOR_SIZE) as u32;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PartitionTableEntry {
    pub name: [u8; 16],
    pub flags: u32,
    pub lba_start: u32,
    pub lba_size: u32,
    pub reserved: u32,
}

impl PartitionTableEntry {
    const fn new(name: [u8; 16], lba_start: u32, lba_size: u32) -> Self {
        Self { name, flags: PE_PARTFLAGS_IN_USE, lba_start, lba_size, reserved: 0 }
    }

    const fn empty() -> Self {
        Self { name: [b' '; 16], flags: 0, lba_start: 0, lba_size: 0, reserved: 0 }
    }

    pub fn in_use(&self) -> bool {
        self.flags & PE_PARTFLAGS_IN_USE != 0
    }

    /// Partition length in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.lba_size as u64 * HDD_SECTOR_SIZE
    }

    /// Partition start in bytes from the beginning of the disk.
    pub fn start_bytes(&self) -> u64 {
        self.lba_start as u64 * HDD_SECTOR_SIZE
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PartitionTable {
    pub magic: [u8; 16],
    pub reserved: [u8; 32],
    pub entries: [PartitionTableEntry; 14],
}

impl PartitionTable {
    /// The fixed table of a standard retail disk. Entry order matches the
    /// partition numbering: entry 0 is Partition1 (E, data), entry 1 is
    /// Partition2 (C, system), entries 2..=4 are the X/Y/Z game caches.
    pub fn hdd_default() -> Self {
        let mut entries = [PartitionTableEntry::empty(); 14];
        entries[0] = PartitionTableEntry::new(*b"XBOX DATA       ", MUSICPART_LBA_START, MUSICPART_LBA_SIZE);
        entries[1] = PartitionTableEntry::new(*b"XBOX SHELL      ", SYSPART_LBA_START, SYSPART_LBA_SIZE);
        entries[2] = PartitionTableEntry::new(*b"XBOX GAME SWAP 1", SWAPPART1_LBA_START, SWAPPART_LBA_SIZE);
        entries[3] = PartitionTableEntry::new(*b"XBOX GAME SWAP 2", SWAPPART2_LBA_START, SWAPPART_LBA_SIZE);
        entries[4] = PartitionTableEntry::new(*b"XBOX GAME SWAP 3", SWAPPART3_LBA_START, SWAPPART_LBA_SIZE);
        Self { magic: PARTITION_TABLE_MAGIC, reserved: [0; 32], entries }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == PARTITION_TABLE_MAGIC
    }

    /// Table entry describing partition `num` (1-based), if any.
    pub fn entry_for_partition(&self, num: usize) -> Option<&PartitionTableEntry> {
        self.entries.get(num.checked_sub(1)?)
    }

    /// Translates an absolute disk byte offset into (partition number,
    /// partition-relative offset). Offsets below every in-use entry fall
    /// into the config area, which the table does not track.
    pub fn partition_for_disk_offset(&self, disk_offset: u64) -> Option<(usize, u64)> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.in_use() {
                let base = entry.start_bytes();
                let end = base + entry.size_bytes() - 1;
                if xstor_common::util::in_range(disk_offset, base, end) {
                    return Some((idx + 1, disk_offset - base));
                }
            }
        }
        if disk_offset < CONFIG_AREA_SIZE {
            return Some((0, disk_offset));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<PartitionTableEntry>(), 32);
    const_assert_eq!(align_of::<PartitionTableEntry>(), 1);
    const_assert_eq!(size_of::<PartitionTable>(), 496);
    const_assert_eq!(offset_of!(PartitionTable, entries), 48);

    #[test]
    fn default_table_layout() {
        let table = PartitionTable::hdd_default();
        assert!(table.has_valid_magic());
        let sys = table.entry_for_partition(2).unwrap();
        assert_eq!(&sys.name, b"XBOX SHELL      ");
        assert_eq!(sys.start_bytes(), 0x8ca8_0000);
        assert_eq!(sys.size_bytes(), 0x1f40_0000);
        assert!(table.entry_for_partition(1).unwrap().size_bytes() > (1 << 30));
        assert!(!table.entries[5].in_use());
    }

    #[test]
    fn disk_offset_translation() {
        let table = PartitionTable::hdd_default();
        // Config area is not covered by the table
        assert_eq!(table.partition_for_disk_offset(0), Some((0, 0)));
        assert_eq!(table.partition_for_disk_offset(0x7ffff), Some((0, 0x7ffff)));
        // First byte of the X game cache
        assert_eq!(table.partition_for_disk_offset(0x0008_0000), Some((3, 0)));
        // Inside the system partition
        assert_eq!(table.partition_for_disk_offset(0x8ca8_0000 + 4096), Some((2, 4096)));
    }
}
