// SPDX-License-Identifier: MIT

//! Free-space btree verification.
//!
//! Walks the by-block ("bno") and by-size ("cnt") trees of one AG,
//! validating structure, claiming every tree block and every free extent
//! in the block map, and tallying the counts the AGF declares.

use oxio::OxIo;

use crate::errors::ScanResult;
use crate::ondisk::{alloc_ptr_off, alloc_rec_off, read_as, AllocKind, AllocRec, SBtreeHdr};
use crate::report::{Finding, Report};
use crate::tracker::BlockUse;

use super::walker::{walk_ag_btree, AgBtVisitor};
use super::{AgCounts, AgCtx};

/// Visitor over one free-space tree. The two flavors share everything but
/// magic, ordering rule and which counters they feed.
pub struct AllocbtScan {
    kind: AllocKind,
}

impl AllocbtScan {
    pub fn new(kind: AllocKind) -> Self {
        Self { kind }
    }
}

impl<IO: OxIo> AgBtVisitor<IO> for AllocbtScan {
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
                "ABT.BLOCK",
                format!("truncated {name} btree block {agno}/{agbno}"),
            ));
            return Ok(());
        };

        let mut suspect = suspect;
        let mut hdr_errors = 0u32;

        if hdr.magic != self.kind.magic() {
            rep.push(Finding::warn(
                "ABT.MAGIC",
                format!(
                    "bad magic {:#x} in {name} btree block {agno}/{agbno}",
                    hdr.magic
                ),
            ));
            hdr_errors += 1;
            if suspect {
                return Ok(());
            }
        }

        // All free-space btree blocks except the roots are freed for a
        // fully used filesystem, thus they count toward the free data
        // block counter.
        if !is_root {
            counts.btreeblks += 1;
            counts.fdblocks += 1;
        }

        if hdr.level as u32 != level {
            rep.push(Finding::warn(
                "ABT.LEVEL",
                format!(
                    "expected level {level} got {} in {name} btree block {agno}/{agbno}",
                    hdr.level
                ),
            ));
            hdr_errors += 1;
            if suspect {
                return Ok(());
            }
        }

        // A tree block already claimed by anything else means the
        // structure shares memory with another; nothing below it can be
        // trusted.
        {
            let mut ag = ctx.map.lock(agno);
            let state = ag.get(agbno);
            if state != BlockUse::Unknown {
                ag.set(agbno, BlockUse::Mult);
                drop(ag);
                rep.push(Finding::warn(
                    "ABT.CLAIM",
                    format!(
                        "{name} free-space btree block claimed (state {state:?}), \
                         agno {agno}, bno {agbno}, suspect {suspect}"
                    ),
                ));
                return Ok(());
            }
            ag.set(agbno, BlockUse::FsMeta);
        }

        let limits = &ctx.mount.alloc_limits;
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
            if hdr_errors > 0 {
                rep.push(Finding::warn(
                    "ABT.NRECS",
                    format!(
                        "bad btree nrecs ({declared}, min={}, max={}) in {name} btree \
                         block {agno}/{agbno}",
                        limits.mnr[0], limits.mxr[0]
                    ),
                ));
            }

            let mut lastblock = 0u32;
            let mut lastcount = 0u32;
            for i in 0..numrecs {
                let Some(rec) = read_as::<AllocRec>(bytes, alloc_rec_off(i)) else {
                    break;
                };
                let b = rec.startblock;
                let len = rec.blockcount;
                let end64 = b as u64 + len as u64;

                if b == 0 || !ctx.mount.geo.agbno_valid(b) {
                    rep.push(Finding::warn(
                        "ABT.REC",
                        format!(
                            "invalid start block {b} in record {i} of {name} btree \
                             block {agno}/{agbno}"
                        ),
                    ));
                    continue;
                }
                if len == 0 || end64 - 1 >= ctx.mount.geo.ag_blocks as u64 {
                    rep.push(Finding::warn(
                        "ABT.REC",
                        format!(
                            "invalid length {len} in record {i} of {name} btree \
                             block {agno}/{agbno}"
                        ),
                    ));
                    continue;
                }
                let end = b + len;

                if self.kind == AllocKind::Bno {
                    if b <= lastblock {
                        rep.push(Finding::warn(
                            "ABT.ORDER",
                            format!(
                                "out-of-order bno btree record {i} ({b} {len}) \
                                 block {agno}/{agbno}"
                            ),
                        ));
                    } else {
                        lastblock = b;
                    }
                } else {
                    counts.fdblocks += len as u64;
                    counts.freeblks += len;
                    if len > counts.longest {
                        counts.longest = len;
                    }
                    if len < lastcount {
                        rep.push(Finding::warn(
                            "ABT.ORDER",
                            format!(
                                "out-of-order cnt btree record {i} ({b} {len}) \
                                 block {agno}/{agbno}"
                            ),
                        ));
                    } else {
                        lastcount = len;
                    }
                }

                // Claim the extent run by run. The first tree to see a
                // block leaves it tentatively free; the second confirms
                // it. Anything else is a conflicting claim.
                let mut bno = b;
                let mut ag = ctx.map.lock(agno);
                while bno < end {
                    let (state, blen) = ag.get_range(bno, end);
                    match state {
                        BlockUse::Unknown => ag.set_range(bno, blen, BlockUse::Free1),
                        BlockUse::Free1 if self.kind == AllocKind::Cnt => {
                            ag.set_range(bno, blen, BlockUse::Free)
                        }
                        state => {
                            ag.set_range(bno, blen, BlockUse::Mult);
                            rep.push(Finding::warn(
                                "ABT.DUP",
                                format!(
                                    "block ({agno},{bno}-{}) multiply claimed by {name} \
                                     space tree, state - {state:?}",
                                    bno + blen - 1
                                ),
                            ));
                        }
                    }
                    bno += blen;
                }
            }
            return Ok(());
        }

        // Interior node.
        if numrecs > limits.mxr[1] {
            numrecs = limits.mxr[1];
            hdr_errors += 1;
        }
        if !is_root && numrecs < limits.mnr[1] {
            numrecs = limits.mnr[1];
            hdr_errors += 1;
        }

        // Don't pass the bogus-tree flag down further if this block looked
        // ok. Bail out if two levels in a row look bad.
        if hdr_errors > 0 {
            rep.push(Finding::warn(
                "ABT.NRECS",
                format!(
                    "bad btree nrecs ({declared}, min={}, max={}) in {name} btree \
                     block {agno}/{agbno}",
                    limits.mnr[1], limits.mxr[1]
                ),
            ));
            if suspect {
                return Ok(());
            }
            suspect = true;
        } else if suspect {
            suspect = false;
        }

        for i in 0..numrecs {
            let Some(ptr) = read_as::<u32>(bytes, alloc_ptr_off(limits.mxr[1], i)) else {
                break;
            };
            if ptr != 0 && ctx.mount.geo.agbno_valid(ptr) {
                walk_ag_btree(ctx, ptr, level, self, suspect, false, counts, rep)?;
            }
        }
        Ok(())
    }
}
