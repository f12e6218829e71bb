// SPDX-License-Identifier: MIT

//! Per-AG header validation and the per-AG scan step.
//!
//! Reads the three header blocks, corrects structurally invalid fields
//! where allowed, scans the free list, drives both tree verifiers and
//! reconciles every count the headers declare against what the trees
//! actually contain.

use oxio::OxIo;

use crate::errors::ScanResult;
use crate::mount::{BlockBuf, BufKind};
use crate::ondisk::{
    read_as, write_as, Agf, Agfl, Agi, AllocKind, InoKind, Superblock, AGFL_BLOCK, AGF_BLOCK,
    AGI_BLOCK, AG_HEADER_BLOCKS, MAX_BTREE_LEVELS, NULL_AGINO, SB_BLOCK,
};
use crate::report::{Finding, Report};
use crate::tracker::BlockUse;

use super::allocbt::AllocbtScan;
use super::inobt::InobtScan;
use super::walker::walk_ag_btree;
use super::{AgCounts, AgCtx};

bitflags::bitflags! {
    /// Which header blocks failed structural validation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AgHdrStatus: u32 {
        /// Superblock replica differs only in secondary fields.
        const SB_SECONDARY = 1 << 0;
        const SB           = 1 << 1;
        const AGF          = 1 << 2;
        const AGI          = 1 << 3;
    }
}

/// Structural validation of the three AG headers. In repair mode the
/// fixable fields are corrected in the buffers; the returned status says
/// which headers were found invalid either way.
fn verify_ag_headers<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    sbbuf: &mut BlockBuf,
    agfbuf: &mut BlockBuf,
    agibuf: &mut BlockBuf,
    rep: &mut Report,
) -> AgHdrStatus {
    let mut status = AgHdrStatus::empty();
    let agno = ctx.agno;
    let geo = &ctx.mount.geo;
    let primary = &ctx.mount.sb;

    // Superblock replica: geometry must match the primary; everything
    // else is secondary and silently refreshable.
    match read_as::<Superblock>(&sbbuf.bytes, 0) {
        Some(sb) => {
            if sb.magic != primary.magic
                || sb.block_size != primary.block_size
                || sb.ag_count != primary.ag_count
                || sb.ag_blocks != primary.ag_blocks
                || sb.inode_size != primary.inode_size
            {
                status |= AgHdrStatus::SB;
            } else if sb.version != primary.version
                || sb.features != primary.features
                || sb.uuid != primary.uuid
                || sb.root_ino != primary.root_ino
                || sb.ino_alignment != primary.ino_alignment
            {
                status |= AgHdrStatus::SB_SECONDARY;
            }
        }
        None => status |= AgHdrStatus::SB,
    }
    if ctx.repair && status.intersects(AgHdrStatus::SB | AgHdrStatus::SB_SECONDARY) {
        // Secondary superblocks are replicas; reset from the primary.
        write_as(&mut sbbuf.bytes, 0, primary);
    }

    // AGF: identity, geometry and freelist window.
    match read_as::<Agf>(&agfbuf.bytes, 0) {
        Some(mut agf) => {
            let agfl_size = Agfl::capacity(geo.block_size);
            let mut bad = agf.magic != crate::ondisk::AGF_MAGIC;
            if agf.seqno != agno {
                bad = true;
                agf.seqno = agno;
            }
            if agf.length != geo.ag_blocks {
                bad = true;
                agf.length = geo.ag_blocks;
            }
            if agf.flfirst >= agfl_size || agf.fllast >= agfl_size || agf.flcount > agfl_size {
                bad = true;
                agf.flfirst = 0;
                agf.fllast = 0;
                agf.flcount = 0;
            }
            for (root, level) in [(agf.bno_root, agf.bno_level), (agf.cnt_root, agf.cnt_level)] {
                if root != 0 && (!geo.agbno_valid(root) || !(1..=MAX_BTREE_LEVELS).contains(&level))
                {
                    bad = true;
                }
            }
            if bad {
                status |= AgHdrStatus::AGF;
                if ctx.repair {
                    agf.magic = crate::ondisk::AGF_MAGIC;
                    write_as(&mut agfbuf.bytes, 0, &agf);
                }
            }
        }
        None => status |= AgHdrStatus::AGF,
    }

    // AGI: identity, geometry and tree roots.
    match read_as::<Agi>(&agibuf.bytes, 0) {
        Some(mut agi) => {
            let mut bad = agi.magic != crate::ondisk::AGI_MAGIC;
            if agi.seqno != agno {
                bad = true;
                agi.seqno = agno;
            }
            if agi.length != geo.ag_blocks {
                bad = true;
                agi.length = geo.ag_blocks;
            }
            for (root, level) in [(agi.root, agi.level), (agi.free_root, agi.free_level)] {
                if root != 0 && (!geo.agbno_valid(root) || !(1..=MAX_BTREE_LEVELS).contains(&level))
                {
                    bad = true;
                }
            }
            if bad {
                status |= AgHdrStatus::AGI;
                if ctx.repair {
                    agi.magic = crate::ondisk::AGI_MAGIC;
                    write_as(&mut agibuf.bytes, 0, &agi);
                }
            }
        }
        None => status |= AgHdrStatus::AGI,
    }

    if !status.is_empty() {
        rep.push(Finding::info(
            "AG.HDR",
            format!("ag header validation status {:#x} for ag {agno}", status.bits()),
        ));
    }

    status
}

/// Walks the circular AGFL free list, marking every listed block free and
/// reconciling the walked length against the declared `flcount`.
fn scan_freelist<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    agf: &Agf,
    counts: &mut AgCounts,
    rep: &mut Report,
) -> ScanResult {
    let agno = ctx.agno;
    let geo = &ctx.mount.geo;

    ctx.map.lock(agno).set(AGFL_BLOCK, BlockUse::FsMeta);

    if agf.flcount == 0 {
        return Ok(());
    }

    let agflbuf = ctx.mount.read_ag_block(agno, AGFL_BLOCK, BufKind::Agfl)?;
    if agflbuf.bad_crc() {
        rep.push(Finding::warn(
            "AGFL.CRC",
            format!("agfl has bad CRC for ag {agno}"),
        ));
    }

    // The AGF fields were not fixed up in check-only mode, so recheck the
    // window before trusting it.
    let agfl_size = Agfl::capacity(geo.block_size);
    if agf.flfirst >= agfl_size || agf.fllast >= agfl_size {
        rep.push(Finding::warn(
            "AGFL.RANGE",
            format!("agf {agno} freelist blocks bad, skipping freelist scan"),
        ));
        return Ok(());
    }

    let mut i = agf.flfirst;
    let mut count = 0u32;
    loop {
        let bno = read_as::<u32>(&agflbuf.bytes, Agfl::entry_off(i)).unwrap_or(0);
        if bno != 0 && geo.agbno_valid(bno) {
            ctx.map.lock(agno).set(bno, BlockUse::Free);
        } else {
            rep.push(Finding::warn(
                "AGFL.ENTRY",
                format!("bad agbno {bno} in agfl, agno {agno}"),
            ));
        }
        count += 1;
        if i == agf.fllast {
            break;
        }
        i += 1;
        if i == agfl_size {
            i = 0;
        }
    }
    if count != agf.flcount {
        rep.push(Finding::warn(
            "AGFL.COUNT",
            format!("freeblk count {count} != flcount {} in ag {agno}", agf.flcount),
        ));
    }

    counts.fdblocks += count as u64;
    Ok(())
}

/// Walks both free-space trees and reconciles the AGF's declared counts
/// against what the trees contained.
fn validate_agf<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    agf: &Agf,
    counts: &mut AgCounts,
    rep: &mut Report,
) -> ScanResult {
    let agno = ctx.agno;
    let geo = &ctx.mount.geo;

    for (kind, root, level) in [
        (AllocKind::Bno, agf.bno_root, agf.bno_level),
        (AllocKind::Cnt, agf.cnt_root, agf.cnt_level),
    ] {
        if root != 0 && geo.agbno_valid(root) && (1..=MAX_BTREE_LEVELS).contains(&level) {
            let mut scan = AllocbtScan::new(kind);
            walk_ag_btree(ctx, root, level, &mut scan, false, true, counts, rep)?;
        } else {
            rep.push(Finding::warn(
                "AGF.ROOT",
                format!("bad agbno {root} for bt{} root, agno {agno}", kind.name()),
            ));
        }
    }

    if agf.freeblks != counts.freeblks {
        rep.push(Finding::warn(
            "AGF.FREEBLKS",
            format!("agf_freeblks {}, counted {} in ag {agno}", agf.freeblks, counts.freeblks),
        ));
    }
    if agf.longest != counts.longest {
        rep.push(Finding::warn(
            "AGF.LONGEST",
            format!("agf_longest {}, counted {} in ag {agno}", agf.longest, counts.longest),
        ));
    }
    if agf.btreeblks as u64 != counts.btreeblks {
        rep.push(Finding::warn(
            "AGF.BTREEBLKS",
            format!(
                "agf_btreeblks {}, counted {} in ag {agno}",
                agf.btreeblks, counts.btreeblks
            ),
        ));
    }
    Ok(())
}

/// Walks the inode btrees and reconciles the AGI's declared counts,
/// reporting any populated unlinked buckets along the way.
fn validate_agi<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    agi: &Agi,
    counts: &mut AgCounts,
    rep: &mut Report,
) -> ScanResult {
    let agno = ctx.agno;
    let geo = &ctx.mount.geo;

    if agi.root != 0 && geo.agbno_valid(agi.root) && (1..=MAX_BTREE_LEVELS).contains(&agi.level) {
        let mut scan = InobtScan::new(InoKind::Ino);
        walk_ag_btree(ctx, agi.root, agi.level, &mut scan, false, true, counts, rep)?;
    } else {
        rep.push(Finding::warn(
            "AGI.ROOT",
            format!("bad agbno {} for inobt root, agno {agno}", agi.root),
        ));
    }

    if ctx.mount.has_finobt() {
        if agi.free_root != 0
            && geo.agbno_valid(agi.free_root)
            && (1..=MAX_BTREE_LEVELS).contains(&agi.free_level)
        {
            let mut scan = InobtScan::new(InoKind::Fino);
            walk_ag_btree(
                ctx,
                agi.free_root,
                agi.free_level,
                &mut scan,
                false,
                true,
                counts,
                rep,
            )?;
        } else {
            rep.push(Finding::warn(
                "AGI.ROOT",
                format!("bad agbno {} for finobt root, agno {agno}", agi.free_root),
            ));
        }
    }

    if agi.icount != counts.icount {
        rep.push(Finding::warn(
            "AGI.ICOUNT",
            format!("agi_count {}, counted {} in ag {agno}", agi.icount, counts.icount),
        ));
    }
    if agi.freecount != counts.agifreecount {
        rep.push(Finding::warn(
            "AGI.FREECOUNT",
            format!(
                "agi_freecount {}, counted {} in ag {agno}",
                agi.freecount, counts.agifreecount
            ),
        ));
    }
    if ctx.mount.has_finobt() && agi.freecount != counts.fibt_freecount {
        rep.push(Finding::warn(
            "AGI.FREECOUNT",
            format!(
                "agi_freecount {}, counted {} in ag {agno} finobt",
                agi.freecount, counts.fibt_freecount
            ),
        ));
    }

    for (i, bucket) in agi.unlinked.iter().enumerate() {
        if *bucket != NULL_AGINO {
            rep.push(Finding::warn(
                "AGI.UNLINKED",
                format!(
                    "agi unlinked bucket {i} is {bucket} in ag {agno} (inode={})",
                    geo.ino(agno, *bucket)
                ),
            ));
        }
    }
    Ok(())
}

/// Scans one AG for obvious corruption: headers, free list, free-space
/// trees, inode trees, and every count in between.
pub fn scan_ag<IO: OxIo>(
    ctx: &AgCtx<'_, IO>,
    counts: &mut AgCounts,
    rep: &mut Report,
) -> ScanResult {
    let agno = ctx.agno;
    let mut sbbuf = ctx.mount.read_ag_block(agno, SB_BLOCK, BufKind::Sb)?;
    let mut agfbuf = ctx.mount.read_ag_block(agno, AGF_BLOCK, BufKind::Agf)?;
    let mut agibuf = ctx.mount.read_ag_block(agno, AGI_BLOCK, BufKind::Agi)?;

    let mut sb_dirty = false;
    let mut agf_dirty = false;
    let mut agi_dirty = false;

    // Fix up bad AG headers.
    let mut status = verify_ag_headers(ctx, &mut sbbuf, &mut agfbuf, &mut agibuf, rep);

    if status.contains(AgHdrStatus::SB_SECONDARY) {
        // Only secondary fields differed; refresh the replica without
        // skipping further processing.
        if ctx.repair {
            sb_dirty = true;
        }
        status &= !AgHdrStatus::SB_SECONDARY;
    }
    if status.contains(AgHdrStatus::SB) {
        if ctx.repair {
            rep.push(Finding::warn("AG.RESET", format!("reset bad sb for ag {agno}")));
            sb_dirty = true;
        } else {
            rep.push(Finding::warn(
                "AG.RESET",
                format!("would reset bad sb for ag {agno}"),
            ));
        }
    }
    if status.contains(AgHdrStatus::AGF) {
        if ctx.repair {
            rep.push(Finding::warn("AG.RESET", format!("reset bad agf for ag {agno}")));
            agf_dirty = true;
        } else {
            rep.push(Finding::warn(
                "AG.RESET",
                format!("would reset bad agf for ag {agno}"),
            ));
        }
    }
    if status.contains(AgHdrStatus::AGI) {
        if ctx.repair {
            rep.push(Finding::warn("AG.RESET", format!("reset bad agi for ag {agno}")));
            agi_dirty = true;
        } else {
            rep.push(Finding::warn(
                "AG.RESET",
                format!("would reset bad agi for ag {agno}"),
            ));
        }
    }

    if !status.is_empty() && !ctx.repair {
        rep.push(Finding::warn(
            "AG.SKIP",
            format!("bad uncorrected agheader {agno}, skipping ag..."),
        ));
        return Ok(());
    }

    // The header region belongs to the filesystem, as do the blocks
    // preallocated for the root inode chunk in AG 0.
    {
        let mut ag = ctx.map.lock(agno);
        ag.set_range(SB_BLOCK, AG_HEADER_BLOCKS, BlockUse::FsMeta);
        if agno == 0 {
            let geo = &ctx.mount.geo;
            let first = geo.agino_to_agbno(ctx.mount.prealloc_inos.start);
            let last = geo.agino_to_agbno(ctx.mount.prealloc_inos.end - 1);
            if geo.agbno_valid(first) && geo.agbno_valid(last) {
                ag.set_range(first, last - first + 1, BlockUse::FsMeta);
            }
        }
    }

    let agf: Agf = read_as(&agfbuf.bytes, 0).unwrap_or_default();
    let agi: Agi = read_as(&agibuf.bytes, 0).unwrap_or_default();

    scan_freelist(ctx, &agf, counts, rep)?;

    validate_agf(ctx, &agf, counts, rep)?;
    validate_agi(ctx, &agi, counts, rep)?;

    debug_assert!(!sb_dirty || ctx.repair);
    debug_assert!(!agf_dirty || ctx.repair);
    debug_assert!(!agi_dirty || ctx.repair);

    // Only pay attention to CRC errors if we can correct them; rewriting
    // the header recomputes the checksum even when no field changed.
    if ctx.repair {
        sb_dirty |= sbbuf.bad_crc();
        agf_dirty |= agfbuf.bad_crc();
        agi_dirty |= agibuf.bad_crc();

        if sb_dirty {
            ctx.mount.write_block(&mut sbbuf)?;
        }
        if agf_dirty {
            ctx.mount.write_block(&mut agfbuf)?;
        }
        if agi_dirty {
            ctx.mount.write_block(&mut agibuf)?;
        }
    }

    Ok(())
}
