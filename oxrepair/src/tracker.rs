// SPDX-License-Identifier: MIT

//! Block claim-state tracking for filesystem scans.
//!
//! One classification per block per AG, recording which structure currently
//! claims it. The map is partitioned by AG behind independent locks; a
//! caller only ever holds the lock of the AG it is mutating, so workers on
//! different AGs never contend and cross-AG deadlock is impossible.

use parking_lot::{Mutex, MutexGuard};

use crate::mount::Geometry;

/// What a block is currently used for, as established by the scan.
///
/// Transitions only move toward more specific or more conservative
/// classifications; a second claim on an already-claimed block lands in
/// `Mult`, never silently wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockUse {
    /// Not yet claimed by anything.
    Unknown = 0,
    /// Seen free by one free-space tree (first pass).
    Free1,
    /// Confirmed free by both free-space trees.
    Free,
    /// In use by file data or file metadata.
    InUse,
    /// Backing an inode chunk.
    Ino,
    /// Owned by filesystem structure: headers, free list, space/inode maps.
    FsMeta,
    /// Claimed by more than one structure; the canonical corruption signal.
    Mult,
    /// Unusable classification; should never be observed after a scan.
    Bad,
}

impl BlockUse {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BlockUse::Unknown,
            1 => BlockUse::Free1,
            2 => BlockUse::Free,
            3 => BlockUse::InUse,
            4 => BlockUse::Ino,
            5 => BlockUse::FsMeta,
            6 => BlockUse::Mult,
            _ => BlockUse::Bad,
        }
    }
}

/// Claim states of a single AG. Obtained through [`BlockMap::lock`].
#[derive(Debug)]
pub struct AgStates {
    states: Vec<u8>,
}

impl AgStates {
    fn new(blocks: u32) -> Self {
        Self {
            states: vec![0u8; blocks as usize],
        }
    }

    /// State of block `agbno`. Out-of-range block numbers are caller bugs;
    /// block numbers must be validated before claiming.
    #[inline]
    pub fn get(&self, agbno: u32) -> BlockUse {
        BlockUse::from_u8(self.states[agbno as usize])
    }

    /// State of `agbno` plus how far that state extends contiguously,
    /// capped at `end` (exclusive).
    pub fn get_range(&self, agbno: u32, end: u32) -> (BlockUse, u32) {
        let first = self.states[agbno as usize];
        let run = self.states[agbno as usize..end as usize]
            .iter()
            .take_while(|&&s| s == first)
            .count() as u32;
        (BlockUse::from_u8(first), run)
    }

    #[inline]
    pub fn set(&mut self, agbno: u32, state: BlockUse) {
        self.states[agbno as usize] = state as u8;
    }

    pub fn set_range(&mut self, agbno: u32, count: u32, state: BlockUse) {
        self.states[agbno as usize..(agbno + count) as usize].fill(state as u8);
    }

    /// Number of tracked blocks.
    pub fn len(&self) -> u32 {
        self.states.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Raw copy of the state bytes, for comparisons in tests and callers
    /// that post-process a finished scan.
    pub fn snapshot(&self) -> Vec<u8> {
        self.states.clone()
    }
}

/// Per-AG block claim map for the whole filesystem.
pub struct BlockMap {
    ags: Vec<Mutex<AgStates>>,
}

impl BlockMap {
    pub fn new(geo: &Geometry) -> Self {
        Self {
            ags: (0..geo.ag_count)
                .map(|_| Mutex::new(AgStates::new(geo.ag_blocks)))
                .collect(),
        }
    }

    /// Locks one AG's states. Callers hold at most one AG lock at a time.
    #[inline]
    pub fn lock(&self, agno: u32) -> MutexGuard<'_, AgStates> {
        self.ags[agno as usize].lock()
    }

    pub fn ag_count(&self) -> u32 {
        self.ags.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            block_size: 4096,
            ag_count: 2,
            ag_blocks: 100,
            inode_size: 512,
            inopblock: 8,
            ino_alignment: 0,
            rt_blocks: 0,
        }
    }

    #[test]
    fn test_set_get() {
        let map = BlockMap::new(&geo());
        let mut ag = map.lock(0);
        assert_eq!(ag.get(10), BlockUse::Unknown);
        ag.set(10, BlockUse::FsMeta);
        assert_eq!(ag.get(10), BlockUse::FsMeta);
        drop(ag);

        // AG 1 is untouched.
        assert_eq!(map.lock(1).get(10), BlockUse::Unknown);
    }

    #[test]
    fn test_range_runs() {
        let map = BlockMap::new(&geo());
        let mut ag = map.lock(0);
        ag.set_range(20, 10, BlockUse::Free1);
        ag.set(25, BlockUse::Mult);

        let (state, run) = ag.get_range(20, 30);
        assert_eq!((state, run), (BlockUse::Free1, 5));
        let (state, run) = ag.get_range(25, 30);
        assert_eq!((state, run), (BlockUse::Mult, 1));
        let (state, run) = ag.get_range(26, 30);
        assert_eq!((state, run), (BlockUse::Free1, 4));
    }

    #[test]
    fn test_range_capped_at_end() {
        let map = BlockMap::new(&geo());
        let mut ag = map.lock(0);
        ag.set_range(0, 50, BlockUse::Free);
        let (_, run) = ag.get_range(10, 20);
        assert_eq!(run, 10);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_is_fatal() {
        let map = BlockMap::new(&geo());
        map.lock(0).get(100);
    }
}
