//! Trace (collection cycle) state visible to the core, and the scan-state
//! plumbing that format/pool fix dispatch runs through.
//!
//! The trace controller itself is out of scope (spec.md §1); this module
//! only carries the slice of its state the core reads (`TraceId`,
//! `TraceSet`, flip status) and the `ScanState` object a `Format::scan`
//! call drives references through.

use crate::error::PoolResult;
use crate::rank::{Rank, TraceSet};
use crate::shield::SegId;

pub use crate::rank::TraceId;

/// External trace-controller surface the core calls through (spec.md §6):
/// whether a trace has flipped (mutator now sees the post-flip view) and
/// which rank band a segment's access should be treated at.
pub trait TraceContext {
    fn is_flipped(&self, trace: TraceId) -> bool;
    fn rank_for_access(&self, seg: SegId) -> Rank;
}

/// The state threaded through one `Format::scan` call. `fix` is the
/// pool-class-specific per-reference colour transition (AMS/AWL fix);
/// it is supplied as a closure so `Format::scan` never needs to know
/// which pool class owns the segment being scanned — mirrors the
/// teacher's `tracer: &mut dyn FnMut(*const GcHeader)` callback shape
/// used throughout `mark_sweep.rs`/`ephemeron.rs`.
pub struct ScanState<'a> {
    /// The set of traces this scan is being performed for.
    pub traces: TraceSet,
    /// The rank at which references in the scanned area are being treated.
    pub rank: Rank,
    /// Cleared by `fix` whenever it encounters a white reference that
    /// survives (is kept) or is splatted; used by AWL's statistics band
    /// and by callers that need to know whether anything was retained.
    pub was_marked: bool,
    fixer: &'a mut dyn FnMut(&mut usize, Rank, &mut bool) -> PoolResult<()>,
}

impl<'a> ScanState<'a> {
    pub fn new(
        traces: TraceSet,
        rank: Rank,
        fixer: &'a mut dyn FnMut(&mut usize, Rank, &mut bool) -> PoolResult<()>,
    ) -> Self {
        ScanState { traces, rank, was_marked: true, fixer }
    }

    /// Fix one reference in place, dispatching to the pool-class-specific
    /// colour transition. `reference` is the client address; it may be
    /// overwritten (e.g. splatted to 0 for a dead weak reference).
    pub fn fix(&mut self, reference: &mut usize) -> PoolResult<()> {
        (self.fixer)(reference, self.rank, &mut self.was_marked)
    }
}
