// SPDX-License-Identifier: MIT

//! Block-mapping btree verification, one inode fork at a time.
//!
//! Unlike the AG trees, anything that looks wrong in an inode's own
//! mapping tree is grounds to give up on that inode entirely; a wrong
//! answer here risks silently losing or duplicating user data. The one
//! repair performed in place is an interior key that disagrees with its
//! child's true first key.

use oxio::OxIo;

use crate::incore::{DupExtents, RtDupExtents};
use crate::mount::Mount;
use crate::ondisk::{
    bmbt_key_off, bmbt_ptr_off, bmbt_rec_off, read_as, write_as, BmbtKey, BmbtRec, Fork,
    LBtreeHdr, MAX_EXTENT_LEN, NULL_FILEOFF, NULL_FSBLOCK,
};
use crate::report::{Finding, Report};
use crate::tracker::{BlockMap, BlockUse};

use super::walker::{walk_bmap_btree, BmapVisitor};

/// Marker: the inode owning the tree under scan cannot be trusted and
/// must be invalidated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadInode;

/// How a traversal uses the block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmapMode {
    /// Claim every visited block and every mapped extent.
    Claim,
    /// Claim nothing; flag the inode if any visited or mapped block
    /// overlaps the duplicate registries.
    CheckDups,
}

/// Context for block-mapping traversals. These run per inode, after the
/// AG scans, and may touch blocks in any AG.
pub struct BmapCtx<'a, IO: OxIo> {
    pub mount: &'a Mount<IO>,
    pub map: &'a BlockMap,
    pub dups: &'a DupExtents,
    pub rtdups: &'a RtDupExtents,
    pub repair: bool,
}

/// Totals accumulated over one fork traversal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BmapTotals {
    /// Tree blocks plus mapped data blocks.
    pub blocks: u64,
    /// Extent records seen.
    pub extents: u64,
}

#[derive(Debug, Clone, Copy)]
struct CursorLevel {
    fsbno: u64,
    right: u64,
    first_key: u64,
    last_key: u64,
}

impl CursorLevel {
    fn new() -> Self {
        Self {
            fsbno: NULL_FSBLOCK,
            right: NULL_FSBLOCK,
            first_key: NULL_FILEOFF,
            last_key: NULL_FILEOFF,
        }
    }
}

/// Per-level traversal state: the block most recently visited at each
/// level, its siblings and its key range. Lets sibling continuity and key
/// ordering be validated without re-reading blocks.
struct BmapCursor {
    levels: Vec<CursorLevel>,
}

impl BmapCursor {
    fn new(nlevels: u32) -> Self {
        Self {
            levels: vec![CursorLevel::new(); nlevels as usize],
        }
    }
}

/// Visitor over one inode fork's mapping tree.
pub struct BmapScan {
    ino: u64,
    fork: Fork,
    /// File data lives on the real-time subdevice.
    realtime: bool,
    mode: BmapMode,
    cursor: BmapCursor,
    totals: BmapTotals,
}

impl BmapScan {
    fn new(ino: u64, fork: Fork, realtime: bool, mode: BmapMode, nlevels: u32) -> Self {
        Self {
            ino,
            fork,
            realtime,
            mode,
            cursor: BmapCursor::new(nlevels),
            totals: BmapTotals::default(),
        }
    }

    /// Whether extents of this fork live on the real-time subdevice.
    fn rt_extents(&self) -> bool {
        // The attribute fork of a real-time file still lives on the
        // regular filesystem.
        self.realtime && self.fork == Fork::Data
    }

    /// Validates the extent records of a leaf block, claims the mapped
    /// blocks and returns the block's first and last logical offsets.
    fn process_reclist<IO: OxIo>(
        &mut self,
        ctx: &BmapCtx<'_, IO>,
        bytes: &[u8],
        numrecs: u32,
        rep: &mut Report,
    ) -> Result<(u64, u64), BadInode> {
        let ino = self.ino;
        let forkname = self.fork.name();
        let mut first_key = NULL_FILEOFF;
        let mut last_end = 0u64;
        let mut last_off = NULL_FILEOFF;

        for i in 0..numrecs {
            let Some(rec) = read_as::<BmbtRec>(bytes, bmbt_rec_off(i)) else {
                break;
            };
            let off = rec.startoff;
            let b = rec.startblock;
            let len = rec.blockcount;

            if len == 0 || len > MAX_EXTENT_LEN {
                rep.push(Finding::warn(
                    "BMBT.REC",
                    format!(
                        "malformed extent length {len} in record {i} of inode {ino} \
                         ({forkname} fork)"
                    ),
                ));
                return Err(BadInode);
            }

            if self.rt_extents() {
                if ctx.mount.geo.rt_blocks == 0 || b + len as u64 > ctx.mount.geo.rt_blocks {
                    rep.push(Finding::warn(
                        "BMBT.REC",
                        format!(
                            "invalid real-time extent ({b}, {len}) in record {i} of \
                             inode {ino}"
                        ),
                    ));
                    return Err(BadInode);
                }
            } else if !ctx.mount.geo.fsbno_valid(b)
                || !ctx.mount.geo.fsbno_valid(b + len as u64 - 1)
            {
                rep.push(Finding::warn(
                    "BMBT.REC",
                    format!(
                        "invalid extent ({b}, {len}) in record {i} of inode {ino} \
                         ({forkname} fork)"
                    ),
                ));
                return Err(BadInode);
            }

            // Logical offsets must advance without overlap.
            if last_off != NULL_FILEOFF && off < last_end {
                rep.push(Finding::warn(
                    "BMBT.ORDER",
                    format!(
                        "out-of-order or overlapping extent record {i} (offset {off}) \
                         in inode {ino} ({forkname} fork)"
                    ),
                ));
                return Err(BadInode);
            }
            if first_key == NULL_FILEOFF {
                first_key = off;
            }
            last_off = off;
            last_end = off + len as u64;

            self.totals.blocks += len as u64;

            // Claim the mapped blocks; conflicts are survivable so every
            // inode touching a shared block gets flagged.
            if !self.rt_extents() {
                let mut fsb = b;
                let end = b + len as u64;
                while fsb < end {
                    let (agno, agbno) = ctx.mount.geo.split_fsbno(fsb);
                    let ag_end =
                        end.min(ctx.mount.geo.fsbno(agno, 0) + ctx.mount.geo.ag_blocks as u64);
                    let span_end = (agbno as u64 + (ag_end - fsb)) as u32;

                    let mut ag = ctx.map.lock(agno);
                    let mut bno = agbno;
                    while bno < span_end {
                        let (state, blen) = ag.get_range(bno, span_end);
                        match state {
                            BlockUse::Unknown | BlockUse::Free1 | BlockUse::Free => {
                                ag.set_range(bno, blen, BlockUse::InUse)
                            }
                            state => {
                                ag.set_range(bno, blen, BlockUse::Mult);
                                rep.push(Finding::warn(
                                    "BMBT.DUP",
                                    format!(
                                        "inode {ino} extent block ({agno},{bno}-{}) \
                                         claimed, state is {state:?}",
                                        bno + blen - 1
                                    ),
                                ));
                            }
                        }
                        bno += blen;
                    }
                    fsb = ag_end;
                }
            }
        }

        Ok((first_key, last_off))
    }

    /// Duplicate-registry sweep over a leaf block's records.
    fn check_reclist_dups<IO: OxIo>(
        &mut self,
        ctx: &BmapCtx<'_, IO>,
        bytes: &[u8],
        numrecs: u32,
        rep: &mut Report,
    ) -> Result<(), BadInode> {
        for i in 0..numrecs {
            let Some(rec) = read_as::<BmbtRec>(bytes, bmbt_rec_off(i)) else {
                break;
            };
            let b = rec.startblock;
            let len = rec.blockcount;
            if len == 0 || len > MAX_EXTENT_LEN {
                rep.push(Finding::warn(
                    "BMBT.REC",
                    format!(
                        "malformed extent length {len} in record {i} of inode {} \
                         ({} fork)",
                        self.ino,
                        self.fork.name()
                    ),
                ));
                return Err(BadInode);
            }

            if self.rt_extents() {
                if ctx.rtdups.check(b, b + len as u64) {
                    return Err(BadInode);
                }
            } else {
                let mut fsb = b;
                let end = b + len as u64;
                while fsb < end {
                    let (agno, agbno) = ctx.mount.geo.split_fsbno(fsb);
                    let ag_end =
                        end.min(ctx.mount.geo.fsbno(agno, 0) + ctx.mount.geo.ag_blocks as u64);
                    let span = (ag_end - fsb) as u32;
                    if ctx.dups.check(agno, agbno, agbno + span) {
                        return Err(BadInode);
                    }
                    fsb = ag_end;
                }
            }
            self.totals.blocks += len as u64;
        }
        Ok(())
    }
}

impl<IO: OxIo> BmapVisitor<IO> for BmapScan {
    fn visit(
        &mut self,
        ctx: &BmapCtx<'_, IO>,
        bytes: &mut [u8],
        level: u32,
        fsbno: u64,
        is_root: bool,
        dirty: &mut bool,
        rep: &mut Report,
    ) -> Result<(), BadInode> {
        let ino = self.ino;
        let forkname = self.fork.name();
        let Some(hdr) = read_as::<LBtreeHdr>(bytes, 0) else {
            rep.push(Finding::warn(
                "BMBT.BLOCK",
                format!("truncated bmbt block {fsbno} of inode {ino}"),
            ));
            return Err(BadInode);
        };

        if hdr.magic != self.fork.magic() {
            rep.push(Finding::warn(
                "BMBT.MAGIC",
                format!(
                    "bad magic # {:#x} in inode {ino} ({forkname} fork) bmbt \
                     block {fsbno}",
                    hdr.magic
                ),
            ));
            return Err(BadInode);
        }
        if hdr.level as u32 != level {
            rep.push(Finding::warn(
                "BMBT.LEVEL",
                format!(
                    "expected level {level} got {} in inode {ino} ({forkname} fork) \
                     bmbt block {fsbno}",
                    hdr.level
                ),
            ));
            return Err(BadInode);
        }

        if ctx.mount.has_crc() {
            // Ownership stamps must all match: a block with a stale or
            // foreign stamp belongs to some other tree or filesystem.
            if hdr.owner != ino {
                rep.push(Finding::warn(
                    "BMBT.OWNER",
                    format!(
                        "expected owner inode {ino}, got {}, bmbt block {fsbno}",
                        hdr.owner
                    ),
                ));
                return Err(BadInode);
            }
            if hdr.blkno != fsbno {
                rep.push(Finding::warn(
                    "BMBT.BLKNO",
                    format!("expected block {fsbno}, got {}, bmbt block {fsbno}", hdr.blkno),
                ));
                return Err(BadInode);
            }
            if hdr.uuid != *ctx.mount.uuid.as_bytes() {
                rep.push(Finding::warn(
                    "BMBT.UUID",
                    format!("wrong FS UUID, bmbt block {fsbno}"),
                ));
                return Err(BadInode);
            }
        }

        let lvl = level as usize;
        if self.mode == BmapMode::Claim {
            // Check sibling pointers. A mismatch is a conflict between the
            // sibling chain and the parent's child pointers; blow the
            // inode out if that happens.
            if self.cursor.levels[lvl].fsbno != NULL_FSBLOCK {
                if fsbno != self.cursor.levels[lvl].right {
                    rep.push(Finding::warn(
                        "BMBT.SIB",
                        format!(
                            "bad fwd (right) sibling pointer (saw {} parent block \
                             says {fsbno}) in inode {ino} ({forkname} fork) bmap \
                             btree block {}",
                            self.cursor.levels[lvl].right, self.cursor.levels[lvl].fsbno
                        ),
                    ));
                    return Err(BadInode);
                }
                if hdr.leftsib != self.cursor.levels[lvl].fsbno {
                    rep.push(Finding::warn(
                        "BMBT.SIB",
                        format!(
                            "bad back (left) sibling pointer (saw {} parent block \
                             says {}) in inode {ino} ({forkname} fork) bmap btree \
                             block {fsbno}",
                            hdr.leftsib, self.cursor.levels[lvl].fsbno
                        ),
                    ));
                    return Err(BadInode);
                }
            } else if hdr.leftsib != NULL_FSBLOCK {
                // First block on this level must have a null left sibling.
                rep.push(Finding::warn(
                    "BMBT.SIB",
                    format!(
                        "bad back (left) sibling pointer (saw {} should be NULL) \
                         in inode {ino} ({forkname} fork) bmap btree block {fsbno}",
                        hdr.leftsib
                    ),
                ));
                return Err(BadInode);
            }

            self.cursor.levels[lvl].fsbno = fsbno;
            self.cursor.levels[lvl].right = hdr.rightsib;

            // Claim the tree block itself. Conflicts are survivable;
            // traversal keeps going so every other inode impinging on
            // this block gets flagged too.
            let (agno, agbno) = ctx.mount.geo.split_fsbno(fsbno);
            let mut ag = ctx.map.lock(agno);
            let state = ag.get(agbno);
            match state {
                BlockUse::Unknown | BlockUse::Free1 | BlockUse::Free => {
                    ag.set(agbno, BlockUse::InUse)
                }
                BlockUse::InUse | BlockUse::FsMeta | BlockUse::Mult | BlockUse::Ino => {
                    ag.set(agbno, BlockUse::Mult);
                    drop(ag);
                    rep.push(Finding::warn(
                        "BMBT.CLAIM",
                        format!(
                            "inode {ino:#x} bmap block {fsbno:#x} claimed, state \
                             is {state:?}"
                        ),
                    ));
                }
                BlockUse::Bad => {
                    drop(ag);
                    rep.push(Finding::warn(
                        "BMBT.STATE",
                        format!("bad state {state:?}, inode {ino} bmap block {fsbno:#x}"),
                    ));
                }
            }
        } else {
            // Duplicate-detection pass: never claim, only ask whether this
            // block is already known to be contested. Tree blocks always
            // live on the data device, even for a real-time file.
            let (agno, agbno) = ctx.mount.geo.split_fsbno(fsbno);
            if ctx.dups.check(agno, agbno, agbno + 1) {
                return Err(BadInode);
            }
        }

        self.totals.blocks += 1;
        let numrecs = hdr.numrecs as u32;
        let limits = &ctx.mount.bmap_limits;

        if level == 0 {
            if numrecs > limits.mxr[0] || (!is_root && numrecs < limits.mnr[0]) {
                rep.push(Finding::warn(
                    "BMBT.NRECS",
                    format!(
                        "inode {ino} bad # of bmap records ({numrecs}, min - {}, \
                         max - {})",
                        limits.mnr[0], limits.mxr[0]
                    ),
                ));
                return Err(BadInode);
            }
            self.totals.extents += numrecs as u64;

            if self.mode == BmapMode::CheckDups {
                return self.check_reclist_dups(ctx, bytes, numrecs, rep);
            }

            let (first_key, last_key) = self.process_reclist(ctx, bytes, numrecs, rep)?;

            // Key ordering must increase monotonically across sibling
            // leaves; the cursor still holds the previous leaf's range.
            if first_key <= self.cursor.levels[0].last_key
                && self.cursor.levels[0].last_key != NULL_FILEOFF
            {
                rep.push(Finding::warn(
                    "BMBT.ORDER",
                    format!(
                        "out-of-order bmap key (file offset) in inode {ino}, \
                         {forkname} fork, fsbno {fsbno}"
                    ),
                ));
                return Err(BadInode);
            }

            self.cursor.levels[0].first_key = first_key;
            self.cursor.levels[0].last_key = last_key;
            return Ok(());
        }

        // Interior node.
        if numrecs > limits.mxr[1] || (!is_root && numrecs < limits.mnr[1]) {
            rep.push(Finding::warn(
                "BMBT.NRECS",
                format!(
                    "inode {ino} bad # of bmap records ({numrecs}, min - {}, max - {})",
                    limits.mnr[1], limits.mxr[1]
                ),
            ));
            return Err(BadInode);
        }

        for i in 0..numrecs {
            let Some(ptr) = read_as::<u64>(bytes, bmbt_ptr_off(limits.mxr[1], i)) else {
                break;
            };
            if !ctx.mount.geo.fsbno_valid(ptr) {
                rep.push(Finding::warn(
                    "BMBT.PTR",
                    format!("bad bmap btree ptr {ptr:#x} in ino {ino}"),
                ));
                return Err(BadInode);
            }

            walk_bmap_btree(ctx, ptr, level, self, false, rep)?;

            // Fix key (offset) mismatches between the first key in the
            // child block (as recorded in the cursor) and the key in the
            // interior node referencing it. Entries can shift between
            // children without the parent being updated.
            if self.mode == BmapMode::Claim {
                let Some(key) = read_as::<BmbtKey>(bytes, bmbt_key_off(i)) else {
                    break;
                };
                let true_key = self.cursor.levels[lvl - 1].first_key;
                if key.startoff != true_key {
                    if ctx.repair {
                        rep.push(Finding::warn(
                            "BMBT.KEY",
                            format!(
                                "correcting bt key (was {}, now {true_key}) in inode \
                                 {ino} {forkname} fork, btree block {fsbno}",
                                key.startoff
                            ),
                        ));
                        *dirty = true;
                        write_as(bytes, bmbt_key_off(i), &BmbtKey { startoff: true_key });
                    } else {
                        rep.push(Finding::warn(
                            "BMBT.KEY",
                            format!(
                                "bad btree key (is {}, should be {true_key}) in inode \
                                 {ino} {forkname} fork, btree block {fsbno}",
                                key.startoff
                            ),
                        ));
                    }
                }
            }
        }

        // If this is the last node at its level, the last child's forward
        // sibling must be null too.
        if self.mode == BmapMode::Claim
            && self.cursor.levels[lvl].right == NULL_FSBLOCK
            && self.cursor.levels[lvl - 1].right != NULL_FSBLOCK
        {
            rep.push(Finding::warn(
                "BMBT.SIB",
                format!(
                    "bad fwd (right) sibling pointer (saw {} should be NULL) in \
                     inode {ino} ({forkname} fork) bmap btree block {}",
                    self.cursor.levels[lvl - 1].right,
                    self.cursor.levels[lvl - 1].fsbno
                ),
            ));
            return Err(BadInode);
        }

        // Update this level's key range from the node itself.
        if self.mode == BmapMode::Claim && numrecs > 0 {
            if let (Some(first), Some(last)) = (
                read_as::<BmbtKey>(bytes, bmbt_key_off(0)),
                read_as::<BmbtKey>(bytes, bmbt_key_off(numrecs - 1)),
            ) {
                self.cursor.levels[lvl].first_key = first.startoff;
                self.cursor.levels[lvl].last_key = last.startoff;
            }
        }

        Ok(())
    }
}

/// Scans one inode fork's block-mapping btree from its root block.
///
/// In [`BmapMode::Claim`] every tree and data block is claimed in the
/// block map and totals are accumulated; in [`BmapMode::CheckDups`] the
/// duplicate registries are consulted instead. An `Err` means the owning
/// inode must be invalidated by the caller.
#[allow(clippy::too_many_arguments)]
pub fn scan_bmap_fork<IO: OxIo>(
    ctx: &BmapCtx<'_, IO>,
    ino: u64,
    fork: Fork,
    realtime: bool,
    root: u64,
    nlevels: u32,
    mode: BmapMode,
    rep: &mut Report,
) -> Result<BmapTotals, BadInode> {
    if nlevels == 0 || nlevels > crate::ondisk::MAX_BTREE_LEVELS {
        rep.push(Finding::warn(
            "BMBT.LEVEL",
            format!("bad level count {nlevels} for bmap btree of inode {ino}"),
        ));
        return Err(BadInode);
    }
    if !ctx.mount.geo.fsbno_valid(root) {
        rep.push(Finding::warn(
            "BMBT.PTR",
            format!("bad bmap btree root {root:#x} in ino {ino}"),
        ));
        return Err(BadInode);
    }

    let mut scan = BmapScan::new(ino, fork, realtime, mode, nlevels);
    walk_bmap_btree(ctx, root, nlevels, &mut scan, true, rep)?;

    // The root has no siblings; a dangling forward pointer there means
    // the tree continues past what the inode claims to own.
    let top = &scan.cursor.levels[nlevels as usize - 1];
    if mode == BmapMode::Claim && top.right != NULL_FSBLOCK {
        rep.push(Finding::warn(
            "BMBT.SIB",
            format!(
                "bad fwd (right) sibling pointer (saw {} should be NULL) at the \
                 root of inode {ino} ({} fork) bmap btree",
                top.right,
                fork.name()
            ),
        ));
        return Err(BadInode);
    }
    Ok(scan.totals)
}
