// SPDX-License-Identifier: MIT

//! The scan engine: walks every allocation group's metadata btrees,
//! classifies every block, and reconciles the results against the AG and
//! filesystem headers.

mod agheader;
mod allocbt;
mod bmapbt;
mod inobt;
mod walker;

pub use agheader::scan_ag;
pub use allocbt::AllocbtScan;
pub use bmapbt::{scan_bmap_fork, BadInode, BmapCtx, BmapMode, BmapScan, BmapTotals};
pub use inobt::InobtScan;
pub use walker::{walk_ag_btree, walk_bmap_btree, AgBtVisitor, BmapVisitor};

use oxio::OxIo;

use crate::incore::InodeTree;
use crate::mount::Mount;
use crate::report::{Finding, Report};
use crate::tracker::BlockMap;

/// Scan configuration. `repair` gates every write-back decision uniformly;
/// with it off the device is provably untouched.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub repair: bool,
    /// Worker threads for the per-AG fan-out.
    pub workers: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            repair: false,
            workers: 4,
        }
    }
}

/// Counts accumulated while scanning one AG, reconciled against the AG
/// headers afterwards and folded into filesystem totals at the end.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgCounts {
    pub agno: u32,
    /// Free blocks seen by the by-size free-space tree.
    pub freeblks: u32,
    /// Longest free extent seen.
    pub longest: u32,
    /// Non-root free-space btree blocks.
    pub btreeblks: u64,
    /// Inodes counted from the inode btree.
    pub icount: u32,
    /// Free inodes counted from the inode btree.
    pub agifreecount: u32,
    /// Free inodes counted from the free-inode btree.
    pub fibt_freecount: u32,
    /// Free data blocks: free extents, freelist entries and non-root
    /// free-space btree blocks.
    pub fdblocks: u64,
    /// Free inode contribution to the filesystem total.
    pub ifreecount: u64,
}

/// Everything a per-AG scan step needs, threaded explicitly.
pub struct AgCtx<'a, IO: OxIo> {
    pub mount: &'a Mount<IO>,
    pub map: &'a BlockMap,
    pub itree: &'a InodeTree,
    pub agno: u32,
    pub repair: bool,
}

/// Scans every allocation group and reconciles the summed counts against
/// the filesystem-wide superblock counters.
///
/// One task per AG is dispatched across a fixed pool of workers; each
/// worker owns a contiguous slice of the per-AG counter table, so no two
/// tasks ever touch the same slot. All findings are merged in AG order
/// after the barrier, keeping output deterministic.
pub fn scan_ags<IO: OxIo + Sync>(
    mount: &Mount<IO>,
    map: &BlockMap,
    itree: &InodeTree,
    opts: &ScanOptions,
) -> Report {
    let ag_count = mount.geo.ag_count as usize;
    let mut counts: Vec<AgCounts> = (0..ag_count)
        .map(|i| AgCounts {
            agno: i as u32,
            ..AgCounts::default()
        })
        .collect();

    let workers = opts.workers.max(1);
    let chunk = ag_count.div_ceil(workers);

    let mut ag_reports: Vec<(u32, Report)> = std::thread::scope(|s| {
        let handles: Vec<_> = counts
            .chunks_mut(chunk)
            .map(|slots| {
                s.spawn(move || {
                    let mut out = Vec::with_capacity(slots.len());
                    for cnts in slots {
                        let mut rep = Report::default();
                        let ctx = AgCtx {
                            mount,
                            map,
                            itree,
                            agno: cnts.agno,
                            repair: opts.repair,
                        };
                        if let Err(e) = scan_ag(&ctx, cnts, &mut rep) {
                            rep.push(Finding::err(
                                "AG.FATAL",
                                format!("giving up on AG {}: {e}", cnts.agno),
                            ));
                        }
                        out.push((cnts.agno, rep));
                    }
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().expect("scan worker panicked"))
            .collect()
    });

    ag_reports.sort_by_key(|(agno, _)| *agno);
    let mut report = Report::default();
    for (_, rep) in ag_reports {
        report.merge(rep);
    }

    // Tally up the counts and validate them against the superblock.
    let mut fdblocks = 0u64;
    let mut icount = 0u64;
    let mut ifreecount = 0u64;
    for c in &counts {
        fdblocks += c.fdblocks;
        icount += c.icount as u64;
        ifreecount += c.ifreecount;
    }

    let sb = &mount.sb;
    if sb.icount != icount {
        report.push(Finding::warn(
            "SB.ICOUNT",
            format!("sb_icount {}, counted {icount}", sb.icount),
        ));
    }
    if sb.ifree != ifreecount {
        report.push(Finding::warn(
            "SB.IFREE",
            format!("sb_ifree {}, counted {ifreecount}", sb.ifree),
        ));
    }
    if sb.fdblocks != fdblocks {
        report.push(Finding::warn(
            "SB.FDBLOCKS",
            format!("sb_fdblocks {}, counted {fdblocks}", sb.fdblocks),
        ));
    }

    report
}
