//! Allocation buffer: bump-pointer reserve/commit over a reserved range of
//! one segment (spec.md §4.2).
//!
//! Lifecycle: Reset (no segment) -> Attached (segment bound) -> Trapped
//! (limit lowered to init by the collector) -> Attached -> Reset.

use crate::error::{PoolError, PoolResult};
use crate::rank::RankSet;
use crate::shield::SegId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attachment {
    seg: SegId,
    base: usize,
    /// The collector may only read `[base, scan_limit)`.
    scan_limit: usize,
    /// High-water mark of committed objects.
    init: usize,
    /// Bump pointer for the in-flight reserve/commit pair.
    alloc: usize,
    limit: usize,
    /// Set when the collector has trapped the buffer (lowered `limit` to
    /// `init`) since the last successful commit; forces the next commit
    /// to fail and the caller to retry via fill.
    trapped: bool,
}

/// A reserved, bump-allocated range of one segment.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    rank_set: RankSet,
    attachment: Option<Attachment>,
}

impl Buffer {
    pub fn new(rank_set: RankSet) -> Self {
        Buffer { rank_set, attachment: None }
    }

    pub fn rank_set(&self) -> RankSet {
        self.rank_set
    }

    pub fn is_reset(&self) -> bool {
        self.attachment.is_none()
    }

    pub fn segment(&self) -> Option<SegId> {
        self.attachment.map(|a| a.seg)
    }

    pub fn base(&self) -> Option<usize> {
        self.attachment.map(|a| a.base)
    }

    pub fn scan_limit(&self) -> Option<usize> {
        self.attachment.map(|a| a.scan_limit)
    }

    pub fn init(&self) -> Option<usize> {
        self.attachment.map(|a| a.init)
    }

    pub fn alloc(&self) -> Option<usize> {
        self.attachment.map(|a| a.alloc)
    }

    pub fn limit(&self) -> Option<usize> {
        self.attachment.map(|a| a.limit)
    }

    pub fn is_trapped(&self) -> bool {
        self.attachment.map(|a| a.trapped).unwrap_or(false)
    }

    /// Bind the buffer to a fresh `[base, limit)` range within `seg`, with
    /// `scan_limit = init = alloc = base` (a brand new attach). Callers
    /// that reattach mid-stream (SNC frame pop) use
    /// [`Buffer::attach_at`] instead.
    pub fn attach(&mut self, seg: SegId, base: usize, limit: usize) {
        self.attach_at(seg, base, limit, base, 0);
    }

    /// Bind the buffer to `[base, limit)` within `seg`, with `alloc`
    /// already advanced `used` bytes past `base` (SNC reattaches a buffer
    /// mid-segment when popping to a frame within it).
    pub fn attach_at(&mut self, seg: SegId, base: usize, limit: usize, init: usize, used: usize) {
        debug_assert!(base <= init && init <= limit);
        self.attachment = Some(Attachment {
            seg,
            base,
            scan_limit: base,
            init,
            alloc: init + used,
            limit,
            trapped: false,
        });
    }

    /// Detach the buffer, returning `(seg, init, limit)` of the region
    /// being relinquished so the pool's `bufferEmpty` can reclaim the
    /// tail `[init, limit)`. Returns `None` if already reset.
    pub fn detach(&mut self) -> Option<(SegId, usize, usize)> {
        self.attachment.take().map(|a| (a.seg, a.init, a.limit))
    }

    /// Reserve `size` bytes: returns the address and advances `alloc`.
    /// Fails with [`PoolError::Fail`] if the buffer has no room; the
    /// caller must then ask the pool to fill it.
    pub fn reserve(&mut self, size: usize) -> PoolResult<usize> {
        if size == 0 {
            return Err(PoolError::Param("reserve size must be > 0".into()));
        }
        let a = self.attachment.as_mut().ok_or(PoolError::Fail)?;
        let addr = a.alloc;
        let new_alloc = addr.checked_add(size).ok_or(PoolError::Fail)?;
        if new_alloc > a.limit {
            return Err(PoolError::Fail);
        }
        a.alloc = new_alloc;
        Ok(addr)
    }

    /// Commit the most recent reservation, advancing `init` to `alloc`.
    /// Fails if the buffer was trapped since the reservation was made —
    /// the sole synchronisation point with the collector's flip (spec.md
    /// §4.2, §5 "Ordering guarantees").
    pub fn commit(&mut self) -> PoolResult<()> {
        let a = self.attachment.as_mut().ok_or(PoolError::Fail)?;
        if a.trapped {
            return Err(PoolError::Fail);
        }
        a.init = a.alloc;
        Ok(())
    }

    /// Advance `scan_limit` to `init`, the usual post-flip move recording
    /// "everything committed so far is collector-visible".
    pub fn advance_scan_limit(&mut self) {
        if let Some(a) = self.attachment.as_mut() {
            a.scan_limit = a.init;
        }
    }

    /// Lower `limit` to `init`, trapping the buffer so the next reserve
    /// must call back into the pool and the in-flight commit (if any)
    /// fails.
    pub fn trap(&mut self) {
        if let Some(a) = self.attachment.as_mut() {
            a.limit = a.init;
            a.trapped = true;
        }
    }

    /// Clear the trapped flag, e.g. after the pool has refilled the
    /// buffer with a fresh `limit`.
    pub fn untrap(&mut self) {
        if let Some(a) = self.attachment.as_mut() {
            a.trapped = false;
        }
    }

    /// Move `alloc` directly to `addr` without going through
    /// reserve/commit — used by SNC's frame pop to rewind in place.
    pub fn set_alloc(&mut self, addr: usize) {
        if let Some(a) = self.attachment.as_mut() {
            debug_assert!(a.base <= addr && addr <= a.scan_limit.max(a.init));
            a.alloc = addr;
            a.init = addr;
        }
    }

    /// Debug assertion of invariant (I5): `base <= scan_limit <= init <=
    /// alloc <= limit`.
    #[cfg(debug_assertions)]
    pub fn check_invariant(&self) {
        if let Some(a) = self.attachment {
            assert!(a.base <= a.scan_limit);
            assert!(a.scan_limit <= a.init);
            assert!(a.init <= a.alloc);
            assert!(a.alloc <= a.limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::Rank;

    #[test]
    fn reserve_commit_advances_init() {
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        buf.attach(0, 100, 200);
        let addr = buf.reserve(16).unwrap();
        assert_eq!(addr, 100);
        assert_eq!(buf.alloc(), Some(116));
        assert_eq!(buf.init(), Some(100));
        buf.commit().unwrap();
        assert_eq!(buf.init(), Some(116));
        buf.check_invariant();
    }

    #[test]
    fn reserve_past_limit_fails() {
        let mut buf = Buffer::new(RankSet::EMPTY);
        buf.attach(0, 100, 116);
        assert!(buf.reserve(32).is_err());
    }

    #[test]
    fn trap_forces_commit_retry() {
        let mut buf = Buffer::new(RankSet::EMPTY);
        buf.attach(0, 100, 200);
        buf.reserve(16).unwrap();
        buf.trap();
        assert!(buf.commit().is_err());
        assert_eq!(buf.limit(), Some(100));
    }

    #[test]
    fn detach_returns_tail() {
        let mut buf = Buffer::new(RankSet::EMPTY);
        buf.attach(0, 100, 200);
        buf.reserve(20).unwrap();
        buf.commit().unwrap();
        let (seg, init, limit) = buf.detach().unwrap();
        assert_eq!((seg, init, limit), (0, 120, 200));
        assert!(buf.is_reset());
    }
}
