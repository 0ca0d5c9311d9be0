//! The pool class dispatch surface (spec.md §6 "Pool class virtual
//! table").
//!
//! A closed enum rather than a trait object: `fix`/`scan` sit on the hot
//! path of every trace increment, and spec.md §9 ("Polymorphism over pool
//! classes") calls for monomorphizable dispatch there instead of a vtable
//! indirection per reference fixed. Operations a variant doesn't support
//! (AMS split/merge, AWL single-access, SNC frame push/pop) return
//! [`PoolError::Unimpl`] for the other variants rather than being absent
//! from the surface, so callers can match on the pool's kind once and
//! then call through uniformly.

use crate::ams::{AmsConfig, AmsPool};
use crate::awl::{AwlLimits, AwlPool};
use crate::buffer::Buffer;
use crate::error::{PoolError, PoolResult};
use crate::format::Format;
use crate::rank::{Rank, TraceId, TraceSet};
use crate::segment::Summary;
use crate::shield::{SegId, Shield};
use crate::snc::SncPool;
use crate::trace::ScanState;

pub enum Pool {
    Ams(AmsPool),
    Awl(AwlPool),
    Snc(SncPool),
}

impl Pool {
    pub fn new_ams(alignment: usize, config: AmsConfig) -> Pool {
        Pool::Ams(AmsPool::new(alignment, config))
    }

    pub fn new_awl(alignment: usize, limits: AwlLimits) -> Pool {
        Pool::Awl(AwlPool::new(alignment, limits))
    }

    pub fn new_snc(alignment: usize) -> Pool {
        Pool::Snc(SncPool::new(alignment))
    }

    pub fn total_size(&self) -> usize {
        match self {
            Pool::Ams(p) => p.total_size(),
            Pool::Awl(p) => p.total_size(),
            Pool::Snc(p) => p.total_size(),
        }
    }

    pub fn free_size(&self) -> usize {
        match self {
            Pool::Ams(p) => p.free_size(),
            Pool::Awl(p) => p.free_size(),
            Pool::Snc(p) => p.free_size(),
        }
    }

    pub fn buffer_fill(&mut self, buffer: &mut Buffer, size: usize) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => p.buffer_fill(buffer, size),
            Pool::Awl(p) => {
                let rank = if buffer.rank_set().is_member(Rank::Weak) { Rank::Weak } else { Rank::Exact };
                p.buffer_fill(buffer, size, rank)
            }
            Pool::Snc(p) => p.buffer_fill(buffer, size, buffer.rank_set()),
        }
    }

    /// Return a buffer's unused tail to its pool. AMS and AWL never need
    /// to touch the format/shield for this (the tail just stays whatever
    /// colour it last was); SNC must pad it so subsequent walks see a
    /// placeholder object there.
    pub fn buffer_empty(&mut self, buffer: &mut Buffer, format: &dyn Format, shield: &dyn Shield) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => p.buffer_empty(buffer),
            Pool::Awl(p) => p.buffer_empty(buffer),
            Pool::Snc(p) => p.buffer_empty(buffer, format, shield),
        }
    }

    pub fn whiten(&mut self, seg: SegId, trace: TraceId) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => {
                p.whiten(seg, trace);
                Ok(())
            }
            Pool::Awl(p) => {
                p.whiten(seg, trace);
                Ok(())
            }
            Pool::Snc(_) => Err(PoolError::Unimpl("SNC does no mark/sweep; nothing to whiten")),
        }
    }

    pub fn grey(&mut self, seg: SegId, trace: TraceId) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => {
                p.seg_mut(seg).grey(trace);
                Ok(())
            }
            Pool::Awl(p) => {
                p.seg_mut(seg).grey(trace);
                Ok(())
            }
            Pool::Snc(_) => Err(PoolError::Unimpl("SNC segments are never grey")),
        }
    }

    pub fn blacken(&mut self, seg: SegId, trace_set: TraceSet, format: &dyn Format) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => {
                p.seg_mut(seg).blacken(trace_set, format);
                Ok(())
            }
            Pool::Awl(p) => {
                p.seg_mut(seg).blacken();
                Ok(())
            }
            Pool::Snc(_) => Err(PoolError::Unimpl("SNC segments are never grey")),
        }
    }

    pub fn reclaim(&mut self, seg: SegId, trace: TraceId, format: &dyn Format) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => {
                p.reclaim(seg, trace);
                Ok(())
            }
            Pool::Awl(p) => {
                p.reclaim(seg, trace, format);
                Ok(())
            }
            Pool::Snc(_) => Err(PoolError::Unimpl("SNC does no mark/sweep; nothing to reclaim")),
        }
    }

    pub fn set_summary(&mut self, seg: SegId, summary: Summary) -> PoolResult<()> {
        match self {
            Pool::Ams(p) => {
                p.set_summary(seg, summary);
                Ok(())
            }
            Pool::Awl(p) => {
                p.set_summary(seg, summary);
                Ok(())
            }
            Pool::Snc(p) => {
                p.seg_mut(seg).core.summary = summary;
                Ok(())
            }
        }
    }

    /// Scan a single AMS or AWL segment. SNC scanning takes a different
    /// shape (contiguous-range, no per-object colour dispatch) and is
    /// reached through [`Pool::scan_snc`] instead.
    pub fn scan(
        &mut self,
        seg: SegId,
        ss: &mut ScanState,
        format: &dyn Format,
        shield: &dyn Shield,
        find_dependent: &dyn Fn(usize) -> Option<SegId>,
        dependent_summary: &mut dyn FnMut(SegId),
    ) -> PoolResult<bool> {
        match self {
            Pool::Ams(p) => p.seg_mut(seg).scan(ss, format),
            Pool::Awl(p) => p.seg_mut(seg).scan(ss, format, shield, find_dependent, dependent_summary),
            Pool::Snc(_) => Err(PoolError::Unimpl("SNC scan takes a different shape; use scan_snc")),
        }
    }

    pub fn scan_snc(&self, seg: SegId, live_scan_limit: Option<usize>, ss: &mut ScanState, format: &dyn Format) -> PoolResult<()> {
        match self {
            Pool::Snc(p) => p.scan(seg, live_scan_limit, ss, format),
            _ => Err(PoolError::Unimpl("not an SNC pool")),
        }
    }

    /// AWL's barrier access handler; every other pool class handles
    /// access faults with a plain `fix` call through the shield layer
    /// (out of scope here), never a pool-level single-access gate.
    pub fn access(
        &mut self,
        seg: SegId,
        trace: TraceSet,
        client_ref: usize,
        format: &dyn Format,
        rank: Rank,
        trace_flipped: bool,
        trace_band_is_weak: bool,
    ) -> PoolResult<Option<usize>> {
        match self {
            Pool::Awl(p) => p.access(seg, trace, client_ref, format, rank, trace_flipped, trace_band_is_weak),
            _ => Err(PoolError::Unimpl("single-access optimisation is AWL-specific")),
        }
    }

    /// SNC's frame push/pop; meaningless for the other two pool classes.
    pub fn frame_push(&mut self, buffer: &mut Buffer, refill_size: usize) -> PoolResult<Option<usize>> {
        match self {
            Pool::Snc(p) => p.frame_push(buffer, refill_size, buffer.rank_set()),
            _ => Err(PoolError::Unimpl("frame push/pop is SNC-specific")),
        }
    }

    pub fn frame_pop(&mut self, buffer: &mut Buffer, frame: Option<usize>, format: &dyn Format, shield: &dyn Shield) -> PoolResult<()> {
        match self {
            Pool::Snc(p) => p.frame_pop(buffer, frame, format, shield),
            _ => Err(PoolError::Unimpl("frame push/pop is SNC-specific")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ams::AmsConfig;
    use crate::rank::RankSet;

    #[test]
    fn unsupported_ops_return_unimpl() {
        let mut snc = Pool::new_snc(16);
        let result = snc.whiten(0, TraceId(0));
        assert!(matches!(result, Err(PoolError::Unimpl(_))));
    }

    #[test]
    fn ams_pool_reports_sizes_through_enum() {
        let mut pool = Pool::new_ams(16, AmsConfig { supports_ambiguous: true });
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 160).unwrap();
        assert_eq!(pool.total_size(), 160);
    }
}
