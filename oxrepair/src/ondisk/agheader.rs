// SPDX-License-Identifier: MIT

//! Allocation group header blocks: superblock, AGF, AGI, AGFL.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{AGF_MAGIC, AGFL_MAGIC, AGI_MAGIC, AGI_UNLINKED_BUCKETS, NULL_AGINO, SB_MAGIC};

/// Superblock (88 bytes). Block 0 of AG 0 is the primary; every other AG
/// carries a replica in its block 0.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    /// Block size in bytes, power of two.
    pub block_size: u32,
    /// Number of allocation groups.
    pub ag_count: u32,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// On-disk inode size in bytes.
    pub inode_size: u32,
    /// Required block alignment of inode chunks; 0 disables the check.
    pub ino_alignment: u32,
    /// Format feature word, see [`super::Features`].
    pub features: u32,
    /// Root directory inode number.
    pub root_ino: u64,
    /// Allocated inode count, filesystem wide.
    pub icount: u64,
    /// Free inode count, filesystem wide.
    pub ifree: u64,
    /// Free data block count, filesystem wide.
    pub fdblocks: u64,
    /// Blocks on the real-time subdevice; 0 when absent.
    pub rt_blocks: u64,
    pub uuid: [u8; 16],
    pub crc: u32,
    pub pad: [u8; 4],
}

impl Superblock {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 88;
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            magic: SB_MAGIC,
            version: 5,
            block_size: 4096,
            ag_count: 0,
            ag_blocks: 0,
            inode_size: 512,
            ino_alignment: 0,
            features: 0,
            root_ino: 0,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            rt_blocks: 0,
            uuid: [0; 16],
            crc: 0,
            pad: [0; 4],
        }
    }
}

/// AG free-space header (72 bytes), block 1 of each AG.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Agf {
    pub magic: u32,
    /// AG number this header belongs to.
    pub seqno: u32,
    /// AG length in blocks.
    pub length: u32,
    /// Root of the by-block free-space btree.
    pub bno_root: u32,
    /// Root of the by-size free-space btree.
    pub cnt_root: u32,
    pub bno_level: u32,
    pub cnt_level: u32,
    /// Circular free-list window into the AGFL block.
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    /// Declared free blocks in this AG.
    pub freeblks: u32,
    /// Declared longest free extent.
    pub longest: u32,
    /// Blocks held by the two free-space btrees (roots excluded).
    pub btreeblks: u32,
    pub uuid: [u8; 16],
    pub crc: u32,
}

impl Agf {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 68;
}

impl Default for Agf {
    fn default() -> Self {
        Self {
            magic: AGF_MAGIC,
            seqno: 0,
            length: 0,
            bno_root: 0,
            cnt_root: 0,
            bno_level: 0,
            cnt_level: 0,
            flfirst: 0,
            fllast: 0,
            flcount: 0,
            freeblks: 0,
            longest: 0,
            btreeblks: 0,
            uuid: [0; 16],
            crc: 0,
        }
    }
}

/// AG inode header (316 bytes), block 2 of each AG.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Agi {
    pub magic: u32,
    pub seqno: u32,
    pub length: u32,
    /// Declared allocated inodes in this AG.
    pub icount: u32,
    /// Declared free inodes in this AG.
    pub freecount: u32,
    /// Root and height of the inode btree.
    pub root: u32,
    pub level: u32,
    /// Root and height of the free-inode btree (feature gated).
    pub free_root: u32,
    pub free_level: u32,
    /// Most recently allocated chunk start.
    pub newino: u32,
    /// Unlinked-inode hash buckets; `NULL_AGINO` when empty.
    pub unlinked: [u32; AGI_UNLINKED_BUCKETS],
    pub uuid: [u8; 16],
    pub crc: u32,
}

impl Agi {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 312;
}

impl Default for Agi {
    fn default() -> Self {
        Self {
            magic: AGI_MAGIC,
            seqno: 0,
            length: 0,
            icount: 0,
            freecount: 0,
            root: 0,
            level: 0,
            free_root: 0,
            free_level: 0,
            newino: NULL_AGINO,
            unlinked: [NULL_AGINO; AGI_UNLINKED_BUCKETS],
            uuid: [0; 16],
            crc: 0,
        }
    }
}

/// AGFL block header (32 bytes), block 3 of each AG. The rest of the block
/// is a circular array of AG block numbers indexed by `flfirst..=fllast`.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Agfl {
    pub magic: u32,
    pub seqno: u32,
    pub uuid: [u8; 16],
    pub crc: u32,
    pub pad: [u8; 4],
}

impl Agfl {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 24;
    pub const ENTRIES_OFF: usize = 32;

    /// Capacity of the circular free list for a given block size.
    pub fn capacity(block_size: u32) -> u32 {
        (block_size - Self::ENTRIES_OFF as u32) / 4
    }

    /// Byte offset of entry `i` within the AGFL block.
    pub fn entry_off(i: u32) -> usize {
        Self::ENTRIES_OFF + i as usize * 4
    }
}

impl Default for Agfl {
    fn default() -> Self {
        Self {
            magic: AGFL_MAGIC,
            seqno: 0,
            uuid: [0; 16],
            crc: 0,
            pad: [0; 4],
        }
    }
}
