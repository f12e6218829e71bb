// SPDX-License-Identifier: MIT

//! On-disk format definitions.
//!
//! Everything here is little-endian and mapped with zerocopy over raw block
//! buffers. Layouts are arranged so `#[repr(C)]` introduces no padding.

mod agheader;
mod btree;

pub use agheader::*;
pub use btree::*;

use zerocopy::{FromBytes, Immutable, IntoBytes};

// Magic numbers, one per block kind.

pub const SB_MAGIC: u32 = u32::from_le_bytes(*b"OXSB");
pub const AGF_MAGIC: u32 = u32::from_le_bytes(*b"OXAF");
pub const AGI_MAGIC: u32 = u32::from_le_bytes(*b"OXAI");
pub const AGFL_MAGIC: u32 = u32::from_le_bytes(*b"OXFL");
pub const BNOBT_MAGIC: u32 = u32::from_le_bytes(*b"OXBN");
pub const CNTBT_MAGIC: u32 = u32::from_le_bytes(*b"OXCN");
pub const INOBT_MAGIC: u32 = u32::from_le_bytes(*b"OXIB");
pub const FINOBT_MAGIC: u32 = u32::from_le_bytes(*b"OXFI");
pub const BMAPBT_MAGIC: u32 = u32::from_le_bytes(*b"OXBM");

// Null sentinels used in sibling pointers, unlinked buckets and cursors.

pub const NULL_AGBLOCK: u32 = u32::MAX;
pub const NULL_AGINO: u32 = u32::MAX;
pub const NULL_FSBLOCK: u64 = u64::MAX;
pub const NULL_FILEOFF: u64 = u64::MAX;

/// Fixed header region at the start of every allocation group.
pub const SB_BLOCK: u32 = 0;
pub const AGF_BLOCK: u32 = 1;
pub const AGI_BLOCK: u32 = 2;
pub const AGFL_BLOCK: u32 = 3;
pub const AG_HEADER_BLOCKS: u32 = 4;

/// Inodes per allocation chunk; chunk records always cover this many slots.
pub const INODES_PER_CHUNK: u32 = 64;

/// Hash buckets in the AGI unlinked-inode table.
pub const AGI_UNLINKED_BUCKETS: usize = 64;

/// Hard cap on btree depth; a declared level beyond this is garbage.
pub const MAX_BTREE_LEVELS: u32 = 8;

/// Largest legal extent length in a block-mapping record.
pub const MAX_EXTENT_LEN: u32 = 1 << 21;

bitflags::bitflags! {
    /// Format feature word stored in the superblock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// v5-style metadata: CRCs plus owner/uuid stamps in btree blocks.
        const META_CRC      = 1 << 0;
        /// The free-inode btree is present.
        const FINOBT        = 1 << 1;
        /// Inode chunks may have holes (sparse allocation).
        const SPARSE_INODES = 1 << 2;
    }
}

/// Reads a copy of `T` from `buf` at byte offset `off`.
#[inline]
pub fn read_as<T: FromBytes>(buf: &[u8], off: usize) -> Option<T> {
    T::read_from_prefix(buf.get(off..)?).ok().map(|(v, _)| v)
}

/// Writes `v` into `buf` at byte offset `off`. Returns false if out of room.
#[inline]
pub fn write_as<T: IntoBytes + Immutable>(buf: &mut [u8], off: usize, v: &T) -> bool {
    match buf.get_mut(off..) {
        Some(dst) => v.write_to_prefix(dst).is_ok(),
        None => false,
    }
}

/// CRC32 of a metadata block with its checksum field treated as zero.
pub fn compute_block_crc(block: &[u8], crc_off: usize) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&block[..crc_off]);
    h.update(&[0u8; 4]);
    h.update(&block[crc_off + 4..]);
    h.finalize()
}

pub fn verify_block_crc(block: &[u8], crc_off: usize) -> bool {
    let stored = u32::from_le_bytes(block[crc_off..crc_off + 4].try_into().unwrap());
    stored == compute_block_crc(block, crc_off)
}

pub fn update_block_crc(block: &mut [u8], crc_off: usize) {
    let crc = compute_block_crc(block, crc_off);
    block[crc_off..crc_off + 4].copy_from_slice(&crc.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_roundtrip() {
        let mut block = vec![0xA5u8; 256];
        update_block_crc(&mut block, 64);
        assert!(verify_block_crc(&block, 64));

        block[10] ^= 0xFF;
        assert!(!verify_block_crc(&block, 64));
    }

    #[test]
    fn test_read_write_as() {
        let mut buf = vec![0u8; 32];
        assert!(write_as(&mut buf, 4, &0xDEAD_BEEFu32));
        assert_eq!(read_as::<u32>(&buf, 4), Some(0xDEAD_BEEF));
        assert_eq!(read_as::<u32>(&buf, 30), None);
    }
}
