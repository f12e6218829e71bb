// SPDX-License-Identifier: MIT

//! Consistency scanner and repair classifier for ox filesystem metadata.
//!
//! Walks the free-space, inode and block-mapping btrees of every
//! allocation group, validates every structural invariant the format
//! requires, reconciles what the trees actually contain against what the
//! AG and filesystem headers declare, and classifies what every block is
//! used for. Corruption is detected and recorded here; rebuilding the
//! damaged structures is a later phase's job.

// Core modules
pub mod errors;
pub mod incore;
pub mod mount;
pub mod ondisk;
pub mod report;
pub mod scan;
pub mod tracker;

// Reusable types and entry points
pub use errors::{ScanError, ScanResult};
pub use incore::{DupExtents, InodeTree, RtDupExtents};
pub use mount::{BlockBuf, BufError, BufKind, Geometry, Mount};
pub use report::{Finding, Report, Severity};
pub use scan::{
    scan_ags, scan_bmap_fork, AgCounts, AgCtx, BadInode, BmapCtx, BmapMode, BmapTotals,
    ScanOptions,
};
pub use tracker::{BlockMap, BlockUse};
