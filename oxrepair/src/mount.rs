// SPDX-License-Identifier: MIT

//! Read-mostly mount context: device handle, geometry, feature flags and
//! per-tree record limits. Built once from the primary superblock and passed
//! by reference to every component; nothing here is ambient state.

use uuid::Uuid;

use oxio::OxIo;

use crate::errors::{ScanError, ScanResult};
use crate::ondisk::*;

/// Geometry constants derived from the primary superblock.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub block_size: u32,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub inode_size: u32,
    /// Inodes per filesystem block.
    pub inopblock: u32,
    /// Required block alignment of inode chunks; 0 disables the check.
    pub ino_alignment: u32,
    /// Blocks on the real-time subdevice; 0 when absent.
    pub rt_blocks: u64,
}

impl Geometry {
    /// Whether `agbno` is a valid block number inside any AG.
    #[inline]
    pub fn agbno_valid(&self, agbno: u32) -> bool {
        agbno < self.ag_blocks
    }

    /// Whether `fsbno` names an existing block.
    #[inline]
    pub fn fsbno_valid(&self, fsbno: u64) -> bool {
        let (agno, agbno) = self.split_fsbno(fsbno);
        agno < self.ag_count && self.agbno_valid(agbno)
    }

    #[inline]
    pub fn fsbno(&self, agno: u32, agbno: u32) -> u64 {
        agno as u64 * self.ag_blocks as u64 + agbno as u64
    }

    #[inline]
    pub fn split_fsbno(&self, fsbno: u64) -> (u32, u32) {
        (
            (fsbno / self.ag_blocks as u64) as u32,
            (fsbno % self.ag_blocks as u64) as u32,
        )
    }

    /// AG block holding AG-relative inode `agino`.
    #[inline]
    pub fn agino_to_agbno(&self, agino: u32) -> u32 {
        agino / self.inopblock
    }

    /// Slot of `agino` within its block.
    #[inline]
    pub fn agino_offset(&self, agino: u32) -> u32 {
        agino % self.inopblock
    }

    /// Whether `agino` maps to a block outside the AG header region.
    #[inline]
    pub fn agino_valid(&self, agino: u32) -> bool {
        let agbno = self.agino_to_agbno(agino);
        agbno >= AG_HEADER_BLOCKS && agbno < self.ag_blocks
    }

    /// Absolute inode number.
    #[inline]
    pub fn ino(&self, agno: u32, agino: u32) -> u64 {
        agno as u64 * (self.ag_blocks as u64 * self.inopblock as u64) + agino as u64
    }
}

/// Per-tree record capacity limits, leaf at index 0, node at index 1.
#[derive(Debug, Clone, Copy)]
pub struct BtLimits {
    pub mxr: [u32; 2],
    pub mnr: [u32; 2],
}

/// Block kinds a verified read can expect; selects the CRC field location
/// and, for header blocks, the magic that must be present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    Sb,
    Agf,
    Agi,
    Agfl,
    SBtree,
    LBtree,
}

impl BufKind {
    fn crc_off(self) -> usize {
        match self {
            BufKind::Sb => Superblock::CRC_OFF,
            BufKind::Agf => Agf::CRC_OFF,
            BufKind::Agi => Agi::CRC_OFF,
            BufKind::Agfl => Agfl::CRC_OFF,
            BufKind::SBtree => SBtreeHdr::CRC_OFF,
            BufKind::LBtree => LBtreeHdr::CRC_OFF,
        }
    }

    fn expected_magic(self) -> Option<u32> {
        match self {
            BufKind::Sb => Some(SB_MAGIC),
            BufKind::Agf => Some(AGF_MAGIC),
            BufKind::Agi => Some(AGI_MAGIC),
            BufKind::Agfl => Some(AGFL_MAGIC),
            // Btree magics differ per tree kind; the visitors check them.
            BufKind::SBtree | BufKind::LBtree => None,
        }
    }
}

/// Advisory defect attached to an otherwise successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufError {
    /// Stored CRC does not match the block contents.
    BadCrc,
    /// Gross structural corruption (wrong header magic).
    Corrupt,
}

/// One block read from the device. `err` carries what the read-side
/// verifier found; the read itself still succeeded and callers decide how
/// severe the condition is.
#[derive(Debug)]
pub struct BlockBuf {
    /// Absolute byte offset on the device.
    pub daddr: u64,
    pub kind: BufKind,
    pub bytes: Vec<u8>,
    pub err: Option<BufError>,
}

impl BlockBuf {
    #[inline]
    pub fn bad_crc(&self) -> bool {
        self.err == Some(BufError::BadCrc)
    }
}

/// Mount context over a block device.
pub struct Mount<IO: OxIo> {
    io: IO,
    pub geo: Geometry,
    pub features: Features,
    pub uuid: Uuid,
    /// Copy of the primary superblock.
    pub sb: Superblock,
    pub alloc_limits: BtLimits,
    pub ino_limits: BtLimits,
    pub bmap_limits: BtLimits,
    /// AG-0 inode range reserved at format time (the root chunk); blocks
    /// backing it start out classified as filesystem-owned.
    pub prealloc_inos: core::ops::Range<u32>,
}

impl<IO: OxIo> Mount<IO> {
    /// Reads and validates the primary superblock, then derives the
    /// geometry and per-tree limits.
    pub fn open(io: IO) -> ScanResult<Self> {
        let mut raw = vec![0u8; Superblock::SIZE];
        io.read_at(0, &mut raw).map_err(ScanError::IO)?;
        let sb: Superblock =
            read_as(&raw, 0).ok_or(ScanError::Superblock("short superblock read"))?;

        if sb.magic != SB_MAGIC {
            return Err(ScanError::Superblock("bad superblock magic"));
        }
        if !sb.block_size.is_power_of_two() || sb.block_size < 512 {
            return Err(ScanError::Superblock("bad block size"));
        }
        if sb.ag_count == 0 || sb.ag_blocks <= AG_HEADER_BLOCKS {
            return Err(ScanError::Superblock("bad AG geometry"));
        }
        if sb.inode_size == 0
            || !sb.inode_size.is_power_of_two()
            || sb.inode_size > sb.block_size
        {
            return Err(ScanError::Superblock("bad inode size"));
        }

        let features = Features::from_bits_truncate(sb.features);
        let geo = Geometry {
            block_size: sb.block_size,
            ag_count: sb.ag_count,
            ag_blocks: sb.ag_blocks,
            inode_size: sb.inode_size,
            inopblock: sb.block_size / sb.inode_size,
            ino_alignment: sb.ino_alignment,
            rt_blocks: sb.rt_blocks,
        };

        let bs = sb.block_size as usize;
        let alloc_limits = Self::limits(bs, SBtreeHdr::SIZE, AllocRec::SIZE, AllocRec::SIZE + 4);
        let ino_limits = Self::limits(bs, SBtreeHdr::SIZE, InobtRec::SIZE, 4 + 4);
        let bmap_limits = Self::limits(bs, LBtreeHdr::SIZE, BmbtRec::SIZE, BmbtKey::SIZE + 8);

        let root_agino = (sb.root_ino % (geo.ag_blocks as u64 * geo.inopblock as u64)) as u32;
        let prealloc_inos = root_agino..root_agino.saturating_add(INODES_PER_CHUNK);

        Ok(Self {
            io,
            geo,
            features,
            uuid: Uuid::from_bytes(sb.uuid),
            sb,
            alloc_limits,
            ino_limits,
            bmap_limits,
            prealloc_inos,
        })
    }

    fn limits(bs: usize, hdr: usize, leaf_entry: usize, node_entry: usize) -> BtLimits {
        let mxr = [
            ((bs - hdr) / leaf_entry) as u32,
            ((bs - hdr) / node_entry) as u32,
        ];
        BtLimits {
            mxr,
            mnr: [mxr[0] / 2, mxr[1] / 2],
        }
    }

    #[inline]
    pub fn has_crc(&self) -> bool {
        self.features.contains(Features::META_CRC)
    }

    #[inline]
    pub fn has_finobt(&self) -> bool {
        self.features.contains(Features::FINOBT)
    }

    #[inline]
    pub fn has_sparse_inodes(&self) -> bool {
        self.features.contains(Features::SPARSE_INODES)
    }

    /// Reads one AG-relative block with verification.
    pub fn read_ag_block(&self, agno: u32, agbno: u32, kind: BufKind) -> ScanResult<BlockBuf> {
        self.read_fs_block(self.geo.fsbno(agno, agbno), kind)
            .map_err(|e| match e {
                ScanError::IO(_) => ScanError::ReadBlock { agno, agbno },
                other => other,
            })
    }

    /// Reads one absolutely-addressed block with verification.
    pub fn read_fs_block(&self, fsbno: u64, kind: BufKind) -> ScanResult<BlockBuf> {
        let daddr = fsbno * self.geo.block_size as u64;
        let mut bytes = vec![0u8; self.geo.block_size as usize];
        self.io.read_at(daddr, &mut bytes).map_err(ScanError::IO)?;

        let mut err = None;
        if self.has_crc() && !verify_block_crc(&bytes, kind.crc_off()) {
            err = Some(BufError::BadCrc);
        } else if let Some(magic) = kind.expected_magic() {
            if read_as::<u32>(&bytes, 0) != Some(magic) {
                err = Some(BufError::Corrupt);
            }
        }

        Ok(BlockBuf {
            daddr,
            kind,
            bytes,
            err,
        })
    }

    /// Writes a block back, refreshing its CRC. Rewriting is how a stale
    /// checksum gets corrected even when no logical field changed.
    pub fn write_block(&self, buf: &mut BlockBuf) -> ScanResult {
        if self.has_crc() {
            update_block_crc(&mut buf.bytes, buf.kind.crc_off());
        }
        self.io.write_at(buf.daddr, &buf.bytes).map_err(ScanError::IO)?;
        Ok(())
    }
}
