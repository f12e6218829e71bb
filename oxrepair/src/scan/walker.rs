// SPDX-License-Identifier: MIT

//! Generic btree traversal engines.
//!
//! Two walkers share one contract: read a block, judge its trustworthiness,
//! hand it to a per-tree visitor which recurses through the walker again
//! for its children. The AG walker never writes; the block-mapping walker
//! additionally threads a dirty flag and writes corrected blocks back.

use oxio::OxIo;

use crate::errors::ScanResult;
use crate::mount::BufKind;
use crate::report::{Finding, Report};

use super::bmapbt::{BadInode, BmapCtx};
use super::{AgCounts, AgCtx};

/// Visitor for AG-relative trees (free-space and inode btrees).
pub trait AgBtVisitor<IO: OxIo> {
    #[allow(clippy::too_many_arguments)]
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
    ) -> ScanResult;
}

/// Reads one AG-relative btree block and dispatches it to `visitor`.
///
/// An unreadable block is fatal to the AG being scanned. A readable block
/// that failed verification only lowers trust: the visitor sees it with
/// `suspect` raised and decides how far to keep going.
#[allow(clippy::too_many_arguments)]
pub fn walk_ag_btree<IO: OxIo, V: AgBtVisitor<IO>>(
    ctx: &AgCtx<'_, IO>,
    root: u32,
    nlevels: u32,
    visitor: &mut V,
    suspect: bool,
    is_root: bool,
    counts: &mut AgCounts,
    rep: &mut Report,
) -> ScanResult {
    debug_assert!(nlevels > 0);
    let buf = ctx.mount.read_ag_block(ctx.agno, root, BufKind::SBtree)?;

    let mut suspect = suspect;
    if let Some(err) = buf.err {
        rep.push(Finding::warn(
            "BT.SUSPECT",
            format!("btree block {}/{root} is suspect ({err:?})", ctx.agno),
        ));
        suspect = true;
    }

    visitor.visit(
        ctx,
        &buf.bytes,
        nlevels - 1,
        root,
        suspect,
        is_root,
        counts,
        rep,
    )
}

/// Visitor for file-relative (block-mapping) trees. The visitor may mutate
/// the block in memory and raise `dirty` to request a write-back.
pub trait BmapVisitor<IO: OxIo> {
    #[allow(clippy::too_many_arguments)]
    fn visit(
        &mut self,
        ctx: &BmapCtx<'_, IO>,
        bytes: &mut [u8],
        level: u32,
        fsbno: u64,
        is_root: bool,
        dirty: &mut bool,
        rep: &mut Report,
    ) -> Result<(), BadInode>;
}

/// Reads one absolutely-addressed block-mapping btree block, dispatches it,
/// and writes it back when the visitor dirtied it or the checksum was stale.
///
/// Unlike the AG walker a failed read is survivable: it is reported and the
/// owning inode is marked bad, the rest of the scan continues.
pub fn walk_bmap_btree<IO: OxIo, V: BmapVisitor<IO>>(
    ctx: &BmapCtx<'_, IO>,
    root: u64,
    nlevels: u32,
    visitor: &mut V,
    is_root: bool,
    rep: &mut Report,
) -> Result<(), BadInode> {
    debug_assert!(nlevels > 0);
    let (agno, agbno) = ctx.mount.geo.split_fsbno(root);
    let mut buf = match ctx.mount.read_fs_block(root, BufKind::LBtree) {
        Ok(b) => b,
        Err(_) => {
            rep.push(Finding::warn(
                "BMBT.IO",
                format!("can't read btree block {agno}/{agbno}"),
            ));
            return Err(BadInode);
        }
    };

    // Only a bad CRC matters here; the visitor decides whether the block
    // is otherwise corrupt. A bad CRC always implies the block must be
    // rewritten, since rewriting recomputes it.
    let badcrc = buf.bad_crc();
    if badcrc {
        rep.push(Finding::warn(
            "BMBT.SUSPECT",
            format!("btree block {agno}/{agbno} is suspect, bad CRC"),
        ));
    }

    let mut dirty = false;
    let res = visitor.visit(ctx, &mut buf.bytes, nlevels - 1, root, is_root, &mut dirty, rep);

    debug_assert!(!dirty || ctx.repair);
    if (dirty || badcrc) && ctx.repair && ctx.mount.write_block(&mut buf).is_err() {
        rep.push(Finding::warn(
            "BMBT.IO",
            format!("can't write btree block {agno}/{agbno}"),
        ));
        return Err(BadInode);
    }

    res
}
