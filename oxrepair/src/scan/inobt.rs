// SPDX-License-Identifier: MIT

//! Inode and free-inode btree verification.
//!
//! Both trees feed one validation pipeline: chunk alignment and range
//! checks, block-state claiming (primary tree) or cross-validation against
//! the primary's results (free-inode tree), then import into the in-core
//! inode tree. Records from corrupted surroundings land on the uncertain
//! list instead of being trusted; a later phase inspects those inodes on
//! disk. Getting chunk starts and alignment right matters more than the
//! free/used detail, which is recomputed when the trees are rebuilt.

use oxio::OxIo;

use crate::errors::ScanResult;
use crate::ondisk::{
    ino_ptr_off, ino_rec_off, read_as, InoKind, InobtRec, SBtreeHdr, INODES_PER_CHUNK,
};
use crate::report::{Finding, Report};
use crate::tracker::BlockUse;

use super::walker::{walk_ag_btree, AgBtVisitor};
use super::{AgCounts, AgCtx};

/// Whether slot `offset` of `rec` is a hole. Only meaningful when the
/// format supports sparse chunks.
fn sparse_slot<IO: OxIo>(ctx: &AgCtx<'_, IO>, rec: &InobtRec, offset: u32) -> bool {
    ctx.mount.has_sparse_inodes() && rec.is_sparse(offset)
}

/// Alignment and numeric range validation shared by both record kinds.
///
/// Returns the updated suspicion count and whether the record is too
/// broken to process at all.
fn verify_chunk_align<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    kind: InoKind,
    rec: &InobtRec,
    mut suspect: u32,
    rep: &mut Report,
) -> (u32, bool) {
    let geo = &ctx.mount.geo;
    let agno = ctx.agno;
    let start = rec.startino;
    let off = geo.agino_offset(start);
    let agbno = geo.agino_to_agbno(start);
    let lino = geo.ino(agno, start);
    let name = kind.name();

    // Chunks must start at the beginning of a block, or on a chunk
    // boundary when one block holds several chunks, and must respect the
    // filesystem-wide inode alignment when one is set.
    if start == 0
        || (geo.inopblock <= INODES_PER_CHUNK && off != 0)
        || (geo.inopblock > INODES_PER_CHUNK && start % INODES_PER_CHUNK != 0)
        || (geo.ino_alignment != 0 && agbno % geo.ino_alignment != 0)
    {
        rep.push(Finding::warn(
            "IBT.ALIGN",
            format!("badly aligned {name} rec (starting inode = {lino})"),
        ));
        suspect += 1;
    }

    // Verify numeric validity of the chunk before importing anything.
    if !geo.agino_valid(start) {
        rep.push(Finding::warn(
            "IBT.RANGE",
            format!("bad starting inode # ({lino} ({agno:#x} {start:#x})) in {name} rec, skipping rec"),
        ));
        return (suspect + 1, true);
    }
    if !geo.agino_valid(start + INODES_PER_CHUNK - 1) {
        rep.push(Finding::warn(
            "IBT.RANGE",
            format!(
                "bad ending inode # ({} ({agno:#x} {:#x})) in {name} rec, skipping rec",
                lino + INODES_PER_CHUNK as u64 - 1,
                start + INODES_PER_CHUNK - 1
            ),
        ));
        return (suspect + 1, true);
    }

    (suspect, false)
}

/// Imports the per-inode state of a chunk into the in-core tree (trusted
/// records) or the uncertain list (suspect records), and counts total and
/// free non-sparse inodes along the way.
fn import_chunk<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    kind: InoKind,
    rec: &InobtRec,
    mut suspect: u32,
    nfree: &mut u32,
    ninodes: &mut u32,
    rep: &mut Report,
) -> u32 {
    let agno = ctx.agno;
    let start = rec.startino;
    let mut ag = ctx.itree.lock(agno);

    if suspect == 0 {
        let chunk = if rec.is_free(0) {
            ag.create_free(start)
        } else {
            ag.create_used(start)
        };
        for j in 1..INODES_PER_CHUNK {
            if rec.is_free(j) {
                chunk.mark_free(j);
            } else {
                chunk.mark_used(j);
            }
        }
    } else {
        for j in 0..INODES_PER_CHUNK {
            ag.add_uncertain(start + j, rec.is_free(j));
        }
    }

    // Mark sparse slots in the in-core record and verify they are free;
    // an allocated sparse inode contradicts the format.
    for j in 0..INODES_PER_CHUNK {
        let isfree = rec.is_free(j);
        if sparse_slot(ctx, rec, j) {
            if suspect == 0 && !isfree {
                rep.push(Finding::warn(
                    "IBT.SPARSE",
                    format!(
                        "holemask/free mismatch, {} chunk {agno}/{start}, \
                         holemask {:#x} free {:#x}",
                        kind.name(),
                        rec.holemask,
                        rec.free
                    ),
                ));
                suspect += 1;
            }
            if suspect == 0 {
                if let Some(c) = ag.chunk_mut(start) {
                    c.mark_sparse(j);
                }
            }
        } else {
            if isfree {
                *nfree += 1;
            }
            *ninodes += 1;
        }
    }

    suspect
}

/// Validates one primary-tree chunk record: alignment, backing-block
/// claims, overlap with already-imported chunks, then import.
fn scan_ino_chunk<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    rec: &InobtRec,
    suspect: u32,
    rep: &mut Report,
) -> u32 {
    let geo = &ctx.mount.geo;
    let agno = ctx.agno;
    let start = rec.startino;
    let off = geo.agino_offset(start);
    let lino = geo.ino(agno, start);
    let freecount = rec.freecount as u32;

    let (mut suspect, skip) = verify_chunk_align(ctx, InoKind::Ino, rec, suspect, rep);
    if skip {
        return suspect;
    }

    // Ensure only one in-core entry per chunk.
    {
        let ag = ctx.itree.lock(agno);
        if let Some(first) = ag.find_range(start, start + INODES_PER_CHUNK) {
            rep.push(Finding::warn(
                "IBT.OVERLAP",
                format!(
                    "inode rec for ino {lino} ({agno}/{start}) overlaps existing \
                     rec (start {agno}/{})",
                    first.start
                ),
            ));
            suspect += 1;

            // Two chunks starting at the same place cannot both be
            // imported; skip this one entirely.
            if first.start == start {
                return suspect;
            }
        }
    }

    // Every block backing a non-sparse part of the chunk must be
    // unclaimed, or still carry the provisional filesystem-owned state of
    // the AG-0 preallocated region.
    if off == 0 && suspect == 0 {
        let mut j = 0;
        while j < INODES_PER_CHUNK {
            if !sparse_slot(ctx, rec, j) {
                let agbno = geo.agino_to_agbno(start + j);
                let mut ag = ctx.map.lock(agno);
                let state = ag.get(agbno);
                match state {
                    BlockUse::Unknown => ag.set(agbno, BlockUse::Ino),
                    BlockUse::FsMeta
                        if agno == 0 && ctx.mount.prealloc_inos.contains(&(start + j)) =>
                    {
                        ag.set(agbno, BlockUse::Ino)
                    }
                    state => {
                        drop(ag);
                        rep.push(Finding::warn(
                            "IBT.CLAIM",
                            format!(
                                "inode chunk claims used block, inobt block - \
                                 agno {agno}, bno {agbno}, state {state:?}"
                            ),
                        ));
                        return suspect + 1;
                    }
                }
            }
            j += geo.inopblock;
        }
    }

    let mut nfree = 0u32;
    let mut ninodes = 0u32;
    suspect = import_chunk(ctx, InoKind::Ino, rec, suspect, &mut nfree, &mut ninodes, rep);

    if nfree != freecount {
        rep.push(Finding::warn(
            "IBT.FREECOUNT",
            format!(
                "freecount/free mismatch, inode chunk {agno}/{start}, \
                 freecount {freecount} nfree {nfree}"
            ),
        ));
    }

    if ctx.mount.has_sparse_inodes() && ninodes != rec.count as u32 {
        rep.push(Finding::warn(
            "IBT.COUNT",
            format!(
                "invalid inode count, inode chunk {agno}/{start}, count {} \
                 ninodes {ninodes}",
                rec.count
            ),
        ));
    }

    suspect
}

/// Validates one free-inode-tree chunk record against the states the
/// primary tree scan already established.
fn scan_fino_chunk<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    rec: &InobtRec,
    suspect: u32,
    rep: &mut Report,
) -> u32 {
    let geo = &ctx.mount.geo;
    let agno = ctx.agno;
    let start = rec.startino;
    let off = geo.agino_offset(start);
    let lino = geo.ino(agno, start);
    let freecount = rec.freecount as u32;

    let (mut suspect, skip) = verify_chunk_align(ctx, InoKind::Fino, rec, suspect, rep);
    if skip {
        return suspect;
    }

    // Cross check the backing blocks against what the primary tree scan
    // recorded.
    if off == 0 && suspect == 0 {
        let mut j = 0;
        while j < INODES_PER_CHUNK {
            let agbno = geo.agino_to_agbno(start + j);

            // Sparse slots should not refer to inode blocks.
            if sparse_slot(ctx, rec, j) {
                let state = ctx.map.lock(agno).get(agbno);
                if state == BlockUse::Ino {
                    rep.push(Finding::warn(
                        "FIBT.SPARSE",
                        format!(
                            "sparse inode chunk claims inode block, finobt block - \
                             agno {agno}, bno {agbno}"
                        ),
                    ));
                    suspect += 1;
                }
                j += geo.inopblock;
                continue;
            }

            let mut ag = ctx.map.lock(agno);
            let state = ag.get(agbno);
            if state == BlockUse::Ino {
                // Matches the primary tree.
            } else if state == BlockUse::Unknown
                || (state == BlockUse::FsMeta
                    && agno == 0
                    && ctx.mount.prealloc_inos.contains(&(start + j)))
            {
                // New information the primary scan missed; take it, but
                // with lowered trust.
                ag.set(agbno, BlockUse::Ino);
                drop(ag);
                rep.push(Finding::warn(
                    "FIBT.UNTRACKED",
                    format!(
                        "inode chunk claims untracked block, finobt block - \
                         agno {agno}, bno {agbno}"
                    ),
                ));
                suspect += 1;
            } else {
                drop(ag);
                rep.push(Finding::warn(
                    "FIBT.CLAIM",
                    format!(
                        "inode chunk claims used block, finobt block - \
                         agno {agno}, bno {agbno}, state {state:?}"
                    ),
                ));
                return suspect + 1;
            }
            j += geo.inopblock;
        }
    }

    let mut nfree = 0u32;
    let mut ninodes = 0u32;

    // Copy the overlapping in-core record out so the tree lock is not
    // held across reporting.
    let existing = ctx
        .itree
        .lock(agno)
        .find_range(start, start + INODES_PER_CHUNK)
        .copied();

    match existing {
        Some(first) => {
            if suspect > 0 {
                return suspect;
            }

            if first.start != start {
                rep.push(Finding::warn(
                    "FIBT.MISMATCH",
                    format!(
                        "finobt rec for ino {lino} ({agno}/{start}) does not match \
                         existing rec ({agno}/{})",
                        first.start
                    ),
                ));
                return suspect + 1;
            }

            // Allocation state must agree between the two trees, per
            // inode and per sparse slot.
            for j in 0..INODES_PER_CHUNK {
                let isfree = rec.is_free(j);
                let issparse = sparse_slot(ctx, rec, j);

                if !issparse {
                    ninodes += 1;
                }
                if isfree && !issparse {
                    nfree += 1;
                }

                if suspect == 0 && isfree != first.is_free(j) {
                    suspect += 1;
                }
                if suspect == 0 && issparse != first.is_sparse(j) {
                    suspect += 1;
                }
            }
        }
        None => {
            // The finobt knows a chunk the primary scan never found. Warn
            // and import it; if the primary scan had pushed these inodes
            // onto the uncertain list this import supersedes them.
            rep.push(Finding::warn(
                "FIBT.UNDISCOVERED",
                format!("undiscovered finobt record, ino {lino} ({agno}/{start})"),
            ));
            suspect = import_chunk(
                ctx,
                InoKind::Fino,
                rec,
                suspect,
                &mut nfree,
                &mut ninodes,
                rep,
            );
        }
    }

    // A stray freecount on its own is not tree corruption; the rebuild
    // recomputes it. Warn and keep going.
    if nfree != freecount {
        rep.push(Finding::warn(
            "FIBT.FREECOUNT",
            format!(
                "finobt freecount/free mismatch, inode chunk {agno}/{start}, \
                 freecount {freecount} nfree {nfree}"
            ),
        ));
    }
    if nfree == 0 {
        rep.push(Finding::warn(
            "FIBT.NOFREE",
            format!("finobt record with no free inodes, inode chunk {agno}/{start}"),
        ));
    }
    if ctx.mount.has_sparse_inodes() && ninodes != rec.count as u32 {
        rep.push(Finding::warn(
            "FIBT.COUNT",
            format!(
                "invalid inode count, inode chunk {agno}/{start}, count {} \
                 ninodes {ninodes}",
                rec.count
            ),
        ));
    }

    suspect
}

/// Visitor over the inode btree or the free-inode btree.
pub struct InobtScan {
    kind: InoKind,
}

impl InobtScan {
    pub fn new(kind: InoKind) -> Self {
        Self { kind }
    }
}

impl<IO: OxIo> AgBtVisitor<IO> for InobtScan {
    fn visit(
        &mut self,
        ctx: &AgCtx<'_, IO>,
        bytes: &[u8],
        level: u32,
        agbno: u32,
        suspect: bool,
        is_root: bool,
        counts: &mut AgCounts,
        rep: &mut Report,
    ) -> ScanResult {
        let agno = ctx.agno;
        let name = self.kind.name();
        let Some(hdr) = read_as::<SBtreeHdr>(bytes, 0) else {
            rep.push(Finding::warn(
                "IBT.BLOCK",
                format!("truncated {name} block {agno}/{agbno}"),
            ));
            return Ok(());
        };

        let mut suspect = suspect;
        let mut hdr_errors = 0u32;

        if hdr.magic != self.kind.magic() {
            rep.push(Finding::warn(
                "IBT.MAGIC",
                format!("bad magic {:#x} in {name} block {agno}/{agbno}", hdr.magic),
            ));
            hdr_errors += 1;
            if suspect {
                return Ok(());
            }
        }
        if hdr.level as u32 != level {
            rep.push(Finding::warn(
                "IBT.LEVEL",
                format!(
                    "expected level {level} got {} in {name} block {agno}/{agbno}",
                    hdr.level
                ),
            ));
            hdr_errors += 1;
            if suspect {
                return Ok(());
            }
        }

        // Check for multiply-claimed btree blocks; unknown or free states
        // are acceptable here since the free-space trees may legitimately
        // have seen these blocks first on a corrupted image.
        {
            let mut ag = ctx.map.lock(agno);
            let state = ag.get(agbno);
            match state {
                BlockUse::Unknown | BlockUse::Free1 | BlockUse::Free => {
                    ag.set(agbno, BlockUse::FsMeta)
                }
                state => {
                    ag.set(agbno, BlockUse::Mult);
                    drop(ag);
                    rep.push(Finding::warn(
                        "IBT.BTCLAIM",
                        format!(
                            "{name} btree block claimed (state {state:?}), agno {agno}, \
                             bno {agbno}, suspect {suspect}"
                        ),
                    ));
                }
            }
        }

        let limits = &ctx.mount.ino_limits;
        let declared = hdr.numrecs as u32;
        let mut numrecs = declared;

        if level == 0 {
            if numrecs > limits.mxr[0] {
                numrecs = limits.mxr[0];
                hdr_errors += 1;
            }
            if !is_root && numrecs < limits.mnr[0] {
                numrecs = limits.mnr[0];
                hdr_errors += 1;
            }

            let mut chunk_suspect: u32 = suspect as u32;
            if hdr_errors > 0 {
                rep.push(Finding::warn(
                    "IBT.BLOCK",
                    format!("dubious {name} btree block header {agno}/{agbno}"),
                ));
                chunk_suspect += 1;
            }

            // Each record points at a chunk of inodes; suspicion carries
            // across the records of one block, so one rotten chunk taints
            // the rest.
            for i in 0..numrecs {
                let Some(rec) = read_as::<InobtRec>(bytes, ino_rec_off(i)) else {
                    break;
                };
                let freecount = rec.freecount as u32;
                match self.kind {
                    InoKind::Ino => {
                        let icount = if ctx.mount.has_sparse_inodes() {
                            rec.count as u32
                        } else {
                            INODES_PER_CHUNK
                        };
                        counts.icount += icount;
                        counts.agifreecount += freecount;
                        counts.ifreecount += freecount as u64;
                        chunk_suspect = scan_ino_chunk(ctx, &rec, chunk_suspect, rep);
                    }
                    InoKind::Fino => {
                        // The finobt only tracks records with free inodes,
                        // so only its free count reconciles with the AGI.
                        counts.fibt_freecount += freecount;
                        chunk_suspect = scan_fino_chunk(ctx, &rec, chunk_suspect, rep);
                    }
                }
            }
            return Ok(());
        }

        // Interior node, continue on down.
        if numrecs > limits.mxr[1] {
            numrecs = limits.mxr[1];
            hdr_errors += 1;
        }
        if !is_root && numrecs < limits.mnr[1] {
            numrecs = limits.mnr[1];
            hdr_errors += 1;
        }

        // Clear the flag after one clean level; abandon the subtree after
        // two bad levels in a row.
        if suspect && hdr_errors == 0 {
            suspect = false;
        }
        if hdr_errors > 0 {
            if suspect {
                return Ok(());
            }
            suspect = true;
        }

        for i in 0..numrecs {
            let Some(ptr) = read_as::<u32>(bytes, ino_ptr_off(limits.mxr[1], i)) else {
                break;
            };
            if ptr != 0 && ctx.mount.geo.agbno_valid(ptr) {
                walk_ag_btree(ctx, ptr, level, self, suspect, false, counts, rep)?;
            }
        }
        Ok(())
    }
}
