// SPDX-License-Identifier: MIT

//! Btree block headers, record layouts and tree-kind descriptors.
//!
//! Two header forms exist: short-form blocks used by the AG-local trees
//! (free-space and inode btrees, u32 AG-relative siblings) and long-form
//! blocks used by the per-inode block-mapping trees (u64 absolute siblings).
//! Interior nodes store all keys first, then all child pointers at a fixed
//! offset derived from the per-level record capacity.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{BMAPBT_MAGIC, BNOBT_MAGIC, CNTBT_MAGIC, FINOBT_MAGIC, INOBT_MAGIC};

/// Short-form btree block header (48 bytes).
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SBtreeHdr {
    pub magic: u32,
    /// 0 = leaf.
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u32,
    pub rightsib: u32,
    /// Absolute block number of this block (META_CRC only).
    pub blkno: u64,
    /// Owning AG number (META_CRC only).
    pub owner: u32,
    pub uuid: [u8; 16],
    pub crc: u32,
}

impl SBtreeHdr {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 44;
}

/// Long-form btree block header (64 bytes).
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LBtreeHdr {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u64,
    pub rightsib: u64,
    /// Absolute block number of this block (META_CRC only).
    pub blkno: u64,
    /// Owning inode number (META_CRC only).
    pub owner: u64,
    pub uuid: [u8; 16],
    pub crc: u32,
    pub pad: [u8; 4],
}

impl LBtreeHdr {
    pub const SIZE: usize = size_of::<Self>();
    pub const CRC_OFF: usize = 56;
}

/// Free-space record: one free extent.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct AllocRec {
    pub startblock: u32,
    pub blockcount: u32,
}

impl AllocRec {
    pub const SIZE: usize = size_of::<Self>();
}

/// Inode chunk record. The layout always carries the sparse fields; without
/// the SPARSE_INODES feature `holemask` must be zero and `count` 64.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InobtRec {
    /// First inode of the chunk, AG relative.
    pub startino: u32,
    /// One bit per 4-inode group; a set bit marks a hole.
    pub holemask: u16,
    /// Physically present inodes in the chunk.
    pub count: u8,
    /// Declared free (non-sparse) inodes.
    pub freecount: u8,
    /// One bit per inode; a set bit marks the inode free.
    pub free: u64,
}

impl InobtRec {
    pub const SIZE: usize = size_of::<Self>();

    #[inline]
    pub fn is_free(&self, offset: u32) -> bool {
        self.free & (1u64 << offset) != 0
    }

    /// Whether slot `offset` falls in a hole. Each holemask bit covers
    /// four consecutive inodes.
    #[inline]
    pub fn is_sparse(&self, offset: u32) -> bool {
        self.holemask & (1u16 << (offset / 4)) != 0
    }
}

/// Block-mapping record: one extent of a file fork.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BmbtRec {
    /// Logical offset in blocks.
    pub startoff: u64,
    /// Absolute physical start block.
    pub startblock: u64,
    pub blockcount: u32,
    /// 0 = written, 1 = unwritten preallocation.
    pub state: u32,
}

impl BmbtRec {
    pub const SIZE: usize = size_of::<Self>();
}

/// Interior key of the block-mapping tree.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct BmbtKey {
    pub startoff: u64,
}

impl BmbtKey {
    pub const SIZE: usize = size_of::<Self>();
}

// Interior-node layout helpers. Keys first, pointers at the offset implied
// by the level-1 record capacity, matching how the blocks are written.

#[inline]
pub fn alloc_rec_off(i: u32) -> usize {
    SBtreeHdr::SIZE + i as usize * AllocRec::SIZE
}

#[inline]
pub fn alloc_ptr_off(mxr: u32, i: u32) -> usize {
    SBtreeHdr::SIZE + mxr as usize * AllocRec::SIZE + i as usize * 4
}

#[inline]
pub fn ino_rec_off(i: u32) -> usize {
    SBtreeHdr::SIZE + i as usize * InobtRec::SIZE
}

#[inline]
pub fn ino_ptr_off(mxr: u32, i: u32) -> usize {
    SBtreeHdr::SIZE + mxr as usize * 4 + i as usize * 4
}

#[inline]
pub fn bmbt_rec_off(i: u32) -> usize {
    LBtreeHdr::SIZE + i as usize * BmbtRec::SIZE
}

#[inline]
pub fn bmbt_key_off(i: u32) -> usize {
    LBtreeHdr::SIZE + i as usize * BmbtKey::SIZE
}

#[inline]
pub fn bmbt_ptr_off(mxr: u32, i: u32) -> usize {
    LBtreeHdr::SIZE + mxr as usize * BmbtKey::SIZE + i as usize * 8
}

/// Free-space tree flavor. Selected once at traversal start; carries the
/// magic and record ordering rule for the tree being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Indexed by start block, strictly increasing.
    Bno,
    /// Indexed by extent length, non-decreasing.
    Cnt,
}

impl AllocKind {
    pub fn magic(self) -> u32 {
        match self {
            AllocKind::Bno => BNOBT_MAGIC,
            AllocKind::Cnt => CNTBT_MAGIC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocKind::Bno => "bno",
            AllocKind::Cnt => "cnt",
        }
    }
}

/// Inode tree flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InoKind {
    /// Primary inode btree, every chunk present.
    Ino,
    /// Free-inode btree, only chunks with free inodes.
    Fino,
}

impl InoKind {
    pub fn magic(self) -> u32 {
        match self {
            InoKind::Ino => INOBT_MAGIC,
            InoKind::Fino => FINOBT_MAGIC,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InoKind::Ino => "inobt",
            InoKind::Fino => "finobt",
        }
    }
}

/// File fork holding a block-mapping tree. Both forks share one block
/// magic; the fork only changes diagnostics and real-time handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    Data,
    Attr,
}

impl Fork {
    pub fn magic(self) -> u32 {
        BMAPBT_MAGIC
    }

    pub fn name(self) -> &'static str {
        match self {
            Fork::Data => "data",
            Fork::Attr => "attr",
        }
    }
}
