// SPDX-License-Identifier: MIT
#![allow(dead_code)]

//! Tiny image builder for scan tests: lays out superblocks, AG headers and
//! hand-built btree blocks in a memory buffer.

use oxio::MemOxIo;
use oxrepair::ondisk::*;

pub const BS: u32 = 4096;
pub const INODE_SIZE: u32 = 512;
pub const INOPBLOCK: u32 = BS / INODE_SIZE;

pub struct Image {
    pub bytes: Vec<u8>,
    pub ag_count: u32,
    pub ag_blocks: u32,
    pub features: Features,
    pub uuid: [u8; 16],
    pub root_ino: u64,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub rt_blocks: u64,
}

impl Image {
    pub fn new(ag_count: u32, ag_blocks: u32, features: Features) -> Self {
        Self {
            bytes: vec![0u8; (ag_count as usize) * (ag_blocks as usize) * BS as usize],
            ag_count,
            ag_blocks,
            features,
            uuid: [0x7Au8; 16],
            root_ino: 32,
            icount: 0,
            ifree: 0,
            fdblocks: 0,
            rt_blocks: 0,
        }
    }

    fn has_crc(&self) -> bool {
        self.features.contains(Features::META_CRC)
    }

    pub fn fsbno(&self, agno: u32, agbno: u32) -> u64 {
        agno as u64 * self.ag_blocks as u64 + agbno as u64
    }

    pub fn block_mut(&mut self, agno: u32, agbno: u32) -> &mut [u8] {
        let fsbno = self.fsbno(agno, agbno);
        self.block_mut_fs(fsbno)
    }

    pub fn block_mut_fs(&mut self, fsbno: u64) -> &mut [u8] {
        let off = fsbno as usize * BS as usize;
        &mut self.bytes[off..off + BS as usize]
    }

    /// Writes the primary superblock and one replica per AG. Call after
    /// the global counters are final.
    pub fn write_sb(&mut self) {
        let sb = Superblock {
            magic: SB_MAGIC,
            version: 5,
            block_size: BS,
            ag_count: self.ag_count,
            ag_blocks: self.ag_blocks,
            inode_size: INODE_SIZE,
            ino_alignment: 0,
            features: self.features.bits(),
            root_ino: self.root_ino,
            icount: self.icount,
            ifree: self.ifree,
            fdblocks: self.fdblocks,
            rt_blocks: self.rt_blocks,
            uuid: self.uuid,
            crc: 0,
            pad: [0; 4],
        };
        let crc = self.has_crc();
        for ag in 0..self.ag_count {
            let blk = self.block_mut(ag, SB_BLOCK);
            write_as(blk, 0, &sb);
            if crc {
                update_block_crc(blk, Superblock::CRC_OFF);
            }
        }
    }

    /// Writes an AGF filled with identity fields, letting the caller set
    /// roots and counts.
    pub fn set_agf(&mut self, agno: u32, f: impl FnOnce(&mut Agf)) {
        let mut agf = Agf {
            seqno: agno,
            length: self.ag_blocks,
            uuid: self.uuid,
            ..Agf::default()
        };
        f(&mut agf);
        let crc = self.has_crc();
        let blk = self.block_mut(agno, AGF_BLOCK);
        write_as(blk, 0, &agf);
        if crc {
            update_block_crc(blk, Agf::CRC_OFF);
        }
    }

    pub fn set_agi(&mut self, agno: u32, f: impl FnOnce(&mut Agi)) {
        let mut agi = Agi {
            seqno: agno,
            length: self.ag_blocks,
            uuid: self.uuid,
            ..Agi::default()
        };
        f(&mut agi);
        let crc = self.has_crc();
        let blk = self.block_mut(agno, AGI_BLOCK);
        write_as(blk, 0, &agi);
        if crc {
            update_block_crc(blk, Agi::CRC_OFF);
        }
    }

    pub fn set_agfl(&mut self, agno: u32, entries: &[u32]) {
        let agfl = Agfl {
            seqno: agno,
            uuid: self.uuid,
            ..Agfl::default()
        };
        let crc = self.has_crc();
        let blk = self.block_mut(agno, AGFL_BLOCK);
        write_as(blk, 0, &agfl);
        for (i, bno) in entries.iter().enumerate() {
            write_as(blk, Agfl::entry_off(i as u32), bno);
        }
        if crc {
            update_block_crc(blk, Agfl::CRC_OFF);
        }
    }

    /// Re-reads, mutates and re-checksums an existing AGF.
    pub fn patch_agf(&mut self, agno: u32, f: impl FnOnce(&mut Agf)) {
        let crc = self.has_crc();
        let blk = self.block_mut(agno, AGF_BLOCK);
        let mut agf: Agf = read_as(blk, 0).unwrap();
        f(&mut agf);
        write_as(blk, 0, &agf);
        if crc {
            update_block_crc(blk, Agf::CRC_OFF);
        }
    }

    pub fn patch_agi(&mut self, agno: u32, f: impl FnOnce(&mut Agi)) {
        let crc = self.has_crc();
        let blk = self.block_mut(agno, AGI_BLOCK);
        let mut agi: Agi = read_as(blk, 0).unwrap();
        f(&mut agi);
        write_as(blk, 0, &agi);
        if crc {
            update_block_crc(blk, Agi::CRC_OFF);
        }
    }

    /// Leaf block of a free-space tree, records as (startblock, count).
    pub fn put_alloc_leaf(&mut self, agno: u32, agbno: u32, kind: AllocKind, recs: &[(u32, u32)]) {
        let hdr = SBtreeHdr {
            magic: kind.magic(),
            level: 0,
            numrecs: recs.len() as u16,
            leftsib: NULL_AGBLOCK,
            rightsib: NULL_AGBLOCK,
            blkno: self.fsbno(agno, agbno),
            owner: agno,
            uuid: self.uuid,
            crc: 0,
        };
        let crc = self.has_crc();
        let blk = self.block_mut(agno, agbno);
        write_as(blk, 0, &hdr);
        for (i, (s, l)) in recs.iter().enumerate() {
            write_as(
                blk,
                alloc_rec_off(i as u32),
                &AllocRec {
                    startblock: *s,
                    blockcount: *l,
                },
            );
        }
        if crc {
            update_block_crc(blk, SBtreeHdr::CRC_OFF);
        }
    }

    /// Interior block of a free-space tree, entries as ((key start, key
    /// count), child).
    pub fn put_alloc_node(
        &mut self,
        agno: u32,
        agbno: u32,
        kind: AllocKind,
        level: u16,
        entries: &[((u32, u32), u32)],
    ) {
        let hdr = SBtreeHdr {
            magic: kind.magic(),
            level,
            numrecs: entries.len() as u16,
            leftsib: NULL_AGBLOCK,
            rightsib: NULL_AGBLOCK,
            blkno: self.fsbno(agno, agbno),
            owner: agno,
            uuid: self.uuid,
            crc: 0,
        };
        let mxr_node = (BS as usize - SBtreeHdr::SIZE) as u32 / 12;
        let crc = self.has_crc();
        let blk = self.block_mut(agno, agbno);
        write_as(blk, 0, &hdr);
        for (i, ((s, l), ptr)) in entries.iter().enumerate() {
            write_as(
                blk,
                alloc_rec_off(i as u32),
                &AllocRec {
                    startblock: *s,
                    blockcount: *l,
                },
            );
            write_as(blk, alloc_ptr_off(mxr_node, i as u32), ptr);
        }
        if crc {
            update_block_crc(blk, SBtreeHdr::CRC_OFF);
        }
    }

    /// Leaf block of an inode tree.
    pub fn put_ino_leaf(&mut self, agno: u32, agbno: u32, kind: InoKind, recs: &[InobtRec]) {
        let hdr = SBtreeHdr {
            magic: kind.magic(),
            level: 0,
            numrecs: recs.len() as u16,
            leftsib: NULL_AGBLOCK,
            rightsib: NULL_AGBLOCK,
            blkno: self.fsbno(agno, agbno),
            owner: agno,
            uuid: self.uuid,
            crc: 0,
        };
        let crc = self.has_crc();
        let blk = self.block_mut(agno, agbno);
        write_as(blk, 0, &hdr);
        for (i, rec) in recs.iter().enumerate() {
            write_as(blk, ino_rec_off(i as u32), rec);
        }
        if crc {
            update_block_crc(blk, SBtreeHdr::CRC_OFF);
        }
    }

    /// Leaf block of a block-mapping tree.
    pub fn put_bmbt_leaf(
        &mut self,
        fsbno: u64,
        ino: u64,
        leftsib: u64,
        rightsib: u64,
        recs: &[BmbtRec],
    ) {
        let hdr = LBtreeHdr {
            magic: BMAPBT_MAGIC,
            level: 0,
            numrecs: recs.len() as u16,
            leftsib,
            rightsib,
            blkno: fsbno,
            owner: ino,
            uuid: self.uuid,
            crc: 0,
            pad: [0; 4],
        };
        let crc = self.has_crc();
        let blk = self.block_mut_fs(fsbno);
        write_as(blk, 0, &hdr);
        for (i, rec) in recs.iter().enumerate() {
            write_as(blk, bmbt_rec_off(i as u32), rec);
        }
        if crc {
            update_block_crc(blk, LBtreeHdr::CRC_OFF);
        }
    }

    /// Interior block of a block-mapping tree, entries as (key, child).
    pub fn put_bmbt_node(
        &mut self,
        fsbno: u64,
        ino: u64,
        level: u16,
        leftsib: u64,
        rightsib: u64,
        entries: &[(u64, u64)],
    ) {
        let hdr = LBtreeHdr {
            magic: BMAPBT_MAGIC,
            level,
            numrecs: entries.len() as u16,
            leftsib,
            rightsib,
            blkno: fsbno,
            owner: ino,
            uuid: self.uuid,
            crc: 0,
            pad: [0; 4],
        };
        let mxr_node = (BS as usize - LBtreeHdr::SIZE) as u32 / 16;
        let crc = self.has_crc();
        let blk = self.block_mut_fs(fsbno);
        write_as(blk, 0, &hdr);
        for (i, (key, ptr)) in entries.iter().enumerate() {
            write_as(blk, bmbt_key_off(i as u32), &BmbtKey { startoff: *key });
            write_as(blk, bmbt_ptr_off(mxr_node, i as u32), ptr);
        }
        if crc {
            update_block_crc(blk, LBtreeHdr::CRC_OFF);
        }
    }

    pub fn to_io(&self) -> MemOxIo {
        MemOxIo::from_vec(self.bytes.clone())
    }
}

/// A fully consistent inode chunk record, all slots present.
pub fn chunk_rec(startino: u32, free: u64) -> InobtRec {
    InobtRec {
        startino,
        holemask: 0,
        count: INODES_PER_CHUNK as u8,
        freecount: (free.count_ones()) as u8,
        free,
    }
}

/// Builds a clean single-chunk AG 0 plus an inode-less AG 1.
///
/// AG 0 layout: headers 0-3, root inode chunk blocks 4-11, inobt root 12,
/// bno root 13, cnt root 14, free space 15..ag_blocks.
/// AG 1 layout: headers 0-3, bno root 12, cnt root 13, inobt root 14,
/// free space 4..12 and 15..ag_blocks.
pub fn clean_image(ag_blocks: u32) -> Image {
    let mut img = Image::new(2, ag_blocks, Features::META_CRC);

    // AG 0: one chunk of 64 inodes at agino 32, root inode used.
    let free_mask = !1u64;
    img.put_ino_leaf(0, 12, InoKind::Ino, &[chunk_rec(32, free_mask)]);
    let free0 = ag_blocks - 15;
    img.put_alloc_leaf(0, 13, AllocKind::Bno, &[(15, free0)]);
    img.put_alloc_leaf(0, 14, AllocKind::Cnt, &[(15, free0)]);
    img.set_agf(0, |agf| {
        agf.bno_root = 13;
        agf.bno_level = 1;
        agf.cnt_root = 14;
        agf.cnt_level = 1;
        agf.freeblks = free0;
        agf.longest = free0;
    });
    img.set_agi(0, |agi| {
        agi.root = 12;
        agi.level = 1;
        agi.icount = 64;
        agi.freecount = 63;
    });
    img.set_agfl(0, &[]);

    // AG 1: no inodes at all.
    img.put_ino_leaf(1, 14, InoKind::Ino, &[]);
    let free1a = 8u32;
    let free1b = ag_blocks - 15;
    img.put_alloc_leaf(1, 12, AllocKind::Bno, &[(4, free1a), (15, free1b)]);
    img.put_alloc_leaf(1, 13, AllocKind::Cnt, &[(4, free1a), (15, free1b)]);
    img.set_agf(1, |agf| {
        agf.bno_root = 12;
        agf.bno_level = 1;
        agf.cnt_root = 13;
        agf.cnt_level = 1;
        agf.freeblks = free1a + free1b;
        agf.longest = free1b;
    });
    img.set_agi(1, |agi| {
        agi.root = 14;
        agi.level = 1;
    });
    img.set_agfl(1, &[]);

    img.icount = 64;
    img.ifree = 63;
    img.fdblocks = (free0 + free1a + free1b) as u64;
    img.write_sb();
    img
}
