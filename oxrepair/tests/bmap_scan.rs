// SPDX-License-Identifier: MIT

mod common;

use common::*;
use oxrepair::ondisk::{BmbtRec, Features, Fork};
use oxrepair::{
    scan_bmap_fork, BlockMap, BlockUse, BmapCtx, BmapMode, DupExtents, Mount, Report,
    RtDupExtents,
};

fn rec(startoff: u64, startblock: u64, blockcount: u32) -> BmbtRec {
    BmbtRec {
        startoff,
        startblock,
        blockcount,
        state: 0,
    }
}

/// One AG of 256 blocks; block-mapping scans only need a valid superblock.
fn bmap_image(features: Features) -> Image {
    let mut img = Image::new(1, 256, features);
    img.write_sb();
    img
}

/// Minimum records for a non-root leaf at 4096-byte blocks.
const LEAF_MIN: u32 = (4096 - 64) / 24 / 2;

/// Two full leaves under one interior root; the key for the second child
/// says 95 while the child's true first key is 100. Leaf one maps offsets
/// 0..84 to blocks 60..144, leaf two maps offsets 100..184 to 144..228.
fn two_level_tree(img: &mut Image, ino: u64) {
    let l1: Vec<BmbtRec> = (0..LEAF_MIN).map(|i| rec(i as u64, 60 + i as u64, 1)).collect();
    let l2: Vec<BmbtRec> = (0..LEAF_MIN)
        .map(|i| rec(100 + i as u64, 144 + i as u64, 1))
        .collect();
    img.put_bmbt_leaf(21, ino, u64::MAX, 22, &l1);
    img.put_bmbt_leaf(22, ino, 21, u64::MAX, &l2);
    img.put_bmbt_node(20, ino, 1, u64::MAX, u64::MAX, &[(0, 21), (95, 22)]);
}

#[test]
fn test_stale_interior_key_reported_in_check_only() {
    let mut img = bmap_image(Features::META_CRC);
    two_level_tree(&mut img, 500);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let totals = scan_bmap_fork(&ctx, 500, Fork::Data, false, 20, 2, BmapMode::Claim, &mut rep)
        .expect("tree is structurally sound");

    let hits: Vec<_> = rep.with_code("BMBT.KEY").collect();
    assert_eq!(hits.len(), 1, "{rep}");
    assert!(hits[0].msg.contains("is 95"));
    assert!(hits[0].msg.contains("should be 100"));

    // 3 tree blocks plus one mapped block per record.
    assert_eq!(totals.blocks, 3 + 2 * LEAF_MIN as u64);
    assert_eq!(totals.extents, 2 * LEAF_MIN as u64);

    // Tree and data blocks all claimed.
    let ag = map.lock(0);
    assert_eq!(ag.get(20), BlockUse::InUse);
    assert_eq!(ag.get(21), BlockUse::InUse);
    assert_eq!(ag.get(100), BlockUse::InUse);
    assert_eq!(ag.get(107), BlockUse::InUse);
    drop(ag);

    // Check-only: on-disk bytes are untouched.
    assert_eq!(io.snapshot(), img.bytes);
}

#[test]
fn test_stale_interior_key_repaired_and_revalidates() {
    let mut img = bmap_image(Features::META_CRC);
    two_level_tree(&mut img, 500);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: true,
    };

    let mut rep = Report::default();
    scan_bmap_fork(&ctx, 500, Fork::Data, false, 20, 2, BmapMode::Claim, &mut rep)
        .expect("repairable tree");
    let fixes: Vec<_> = rep.with_code("BMBT.KEY").collect();
    assert_eq!(fixes.len(), 1, "{rep}");
    assert!(fixes[0].msg.contains("correcting"));

    // The corrected block hit the device; a fresh traversal is clean and
    // the rewritten block still verifies (the write refreshed its CRC).
    let map2 = BlockMap::new(&mount.geo);
    let ctx2 = BmapCtx {
        mount: &mount,
        map: &map2,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };
    let mut rep2 = Report::default();
    scan_bmap_fork(&ctx2, 500, Fork::Data, false, 20, 2, BmapMode::Claim, &mut rep2)
        .expect("clean after repair");
    assert!(rep2.findings.is_empty(), "{rep2}");
}

#[test]
fn test_bad_sibling_chain_fails_the_inode() {
    let mut img = bmap_image(Features::META_CRC);
    two_level_tree(&mut img, 500);
    // Second leaf lies about its left neighbor.
    let l2: Vec<BmbtRec> = (0..LEAF_MIN)
        .map(|i| rec(100 + i as u64, 144 + i as u64, 1))
        .collect();
    img.put_bmbt_leaf(22, 500, 99, u64::MAX, &l2);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let res = scan_bmap_fork(&ctx, 500, Fork::Data, false, 20, 2, BmapMode::Claim, &mut rep);
    assert!(res.is_err());
    assert!(rep.with_code("BMBT.SIB").count() >= 1, "{rep}");
}

#[test]
fn test_owner_stamp_mismatch_fails_the_inode() {
    let mut img = bmap_image(Features::META_CRC);
    img.put_bmbt_leaf(30, 999, u64::MAX, u64::MAX, &[rec(0, 100, 4)]);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let res = scan_bmap_fork(&ctx, 500, Fork::Data, false, 30, 1, BmapMode::Claim, &mut rep);
    assert!(res.is_err());
    assert_eq!(rep.with_code("BMBT.OWNER").count(), 1, "{rep}");
}

#[test]
fn test_shared_data_blocks_survive_as_mult() {
    let mut img = bmap_image(Features::META_CRC);
    img.put_bmbt_leaf(30, 500, u64::MAX, u64::MAX, &[rec(0, 100, 4)]);
    img.put_bmbt_leaf(31, 501, u64::MAX, u64::MAX, &[rec(0, 102, 4)]);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    scan_bmap_fork(&ctx, 500, Fork::Data, false, 30, 1, BmapMode::Claim, &mut rep)
        .expect("first inode scans clean");
    // The second traversal keeps going: every inode touching the shared
    // blocks must end up flagged, not just the first collision.
    scan_bmap_fork(&ctx, 501, Fork::Data, false, 31, 1, BmapMode::Claim, &mut rep)
        .expect("conflicts are survivable");

    assert!(rep.with_code("BMBT.DUP").count() >= 1, "{rep}");
    let ag = map.lock(0);
    assert_eq!(ag.get(100), BlockUse::InUse);
    assert_eq!(ag.get(102), BlockUse::Mult);
    assert_eq!(ag.get(103), BlockUse::Mult);
    assert_eq!(ag.get(104), BlockUse::InUse);
}

#[test]
fn test_duplicate_pass_checks_registry_without_claiming() {
    let mut img = bmap_image(Features::META_CRC);
    two_level_tree(&mut img, 500);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    dups.add(0, 104, 108);
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let res = scan_bmap_fork(
        &ctx,
        500,
        Fork::Data,
        false,
        20,
        2,
        BmapMode::CheckDups,
        &mut rep,
    );
    assert!(res.is_err(), "extent 104..108 overlaps the registry");

    // The duplicate pass never claims anything.
    let ag = map.lock(0);
    assert_eq!(ag.get(20), BlockUse::Unknown);
    assert_eq!(ag.get(100), BlockUse::Unknown);
}

#[test]
fn test_realtime_extents_are_bounded_but_never_claimed() {
    let mut img = bmap_image(Features::META_CRC);
    img.rt_blocks = 1000;
    img.write_sb();
    img.put_bmbt_leaf(30, 500, u64::MAX, u64::MAX, &[rec(0, 100, 4)]);
    img.put_bmbt_leaf(31, 501, u64::MAX, u64::MAX, &[rec(0, 990, 20)]);

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let totals = scan_bmap_fork(&ctx, 500, Fork::Data, true, 30, 1, BmapMode::Claim, &mut rep)
        .expect("in-range rt extent");
    assert_eq!(totals.blocks, 1 + 4);
    // Real-time blocks live on the other device; only the tree block is
    // claimed in the block map.
    assert_eq!(map.lock(0).get(100), BlockUse::Unknown);

    // 990 + 20 runs past the end of the rt subdevice.
    let res = scan_bmap_fork(&ctx, 501, Fork::Data, true, 31, 1, BmapMode::Claim, &mut rep);
    assert!(res.is_err());
    assert_eq!(rep.with_code("BMBT.REC").count(), 1, "{rep}");

    // The duplicate pass consults the rt registry for rt extents.
    rtdups.add(102, 103);
    let mut rep2 = Report::default();
    let res = scan_bmap_fork(&ctx, 500, Fork::Data, true, 30, 1, BmapMode::CheckDups, &mut rep2);
    assert!(res.is_err(), "extent 100..104 overlaps the rt registry");
}

#[test]
fn test_out_of_order_offsets_fail_the_inode() {
    let mut img = bmap_image(Features::META_CRC);
    img.put_bmbt_leaf(
        30,
        500,
        u64::MAX,
        u64::MAX,
        &[rec(10, 100, 4), rec(8, 110, 4)],
    );

    let io = img.to_io();
    let mount = Mount::open(&io).unwrap();
    let map = BlockMap::new(&mount.geo);
    let dups = DupExtents::new(1);
    let rtdups = RtDupExtents::new();
    let ctx = BmapCtx {
        mount: &mount,
        map: &map,
        dups: &dups,
        rtdups: &rtdups,
        repair: false,
    };

    let mut rep = Report::default();
    let res = scan_bmap_fork(&ctx, 500, Fork::Data, false, 30, 1, BmapMode::Claim, &mut rep);
    assert!(res.is_err());
    assert_eq!(rep.with_code("BMBT.ORDER").count(), 1, "{rep}");
}
