//! SNC: stack-no-check pool (spec.md §4.6).
//!
//! LIFO frame-based allocation with no mark/sweep at all: a frame is just
//! a saved buffer cursor, and popping it pads and frees every segment
//! acquired since. The one piece of real trickiness is `job003882`: a
//! frame pointer that lands exactly on a segment's limit is ambiguous
//! with the next segment's base, so `frame_push` must eagerly refill the
//! buffer in that case rather than return the ambiguous address.

use crate::error::{PoolError, PoolResult};
use crate::format::Format;
use crate::pool_gen::PoolGen;
use crate::rank::RankSet;
use crate::segment::SegCore;
use crate::shield::{SegId, Shield};
use crate::trace::ScanState;
use crate::buffer::Buffer;

pub struct SncSeg {
    pub core: SegCore,
    next: Option<SegId>,
    /// Set once this segment has been popped and padded; `None` while it
    /// is still (or has always been) the buffer's live top segment.
    padded_limit: Option<usize>,
}

impl SncSeg {
    fn content_limit(&self, live_scan_limit: Option<usize>) -> usize {
        self.padded_limit.unwrap_or_else(|| live_scan_limit.unwrap_or(self.core.base))
    }
}

pub struct SncPool {
    pub pool_gen: PoolGen,
    segs: Vec<SncSeg>,
    free_segs: Option<SegId>,
    alignment: usize,
}

impl SncPool {
    pub fn new(alignment: usize) -> Self {
        SncPool { pool_gen: PoolGen::new(), segs: Vec::new(), free_segs: None, alignment }
    }

    pub fn seg(&self, id: SegId) -> &SncSeg {
        &self.segs[id]
    }

    pub fn seg_mut(&mut self, id: SegId) -> &mut SncSeg {
        &mut self.segs[id]
    }

    pub fn seg_ids(&self) -> impl Iterator<Item = SegId> + '_ {
        0..self.segs.len()
    }

    fn round_up(&self, size: usize) -> usize {
        let mask = self.alignment - 1;
        (size + mask) & !mask
    }

    fn new_seg(&mut self, rank_set: RankSet, size: usize) -> SegId {
        let id = self.segs.len();
        let base = id * (size.max(1)) + 0x2000_0000;
        let size = self.round_up(size.max(self.alignment));
        self.segs.push(SncSeg {
            core: SegCore::new(id, base, base + size, rank_set),
            next: None,
            padded_limit: None,
        });
        self.pool_gen.total_size += size;
        id
    }

    /// `sncFindFreeSeg`: linear search of the freelist for the first
    /// segment big enough to satisfy `size`, detaching it if found.
    fn find_free_seg(&mut self, size: usize) -> Option<SegId> {
        let mut prev: Option<SegId> = None;
        let mut cur = self.free_segs;
        while let Some(id) = cur {
            let seg_size = self.segs[id].core.size();
            let next = self.segs[id].next;
            if seg_size >= size {
                match prev {
                    Some(p) => self.segs[p].next = next,
                    None => self.free_segs = next,
                }
                self.segs[id].next = None;
                self.segs[id].padded_limit = None;
                return Some(id);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// `SNCBufferFill`: reuse a freelist segment if one is big enough,
    /// else allocate a fresh one, and prepend it to the buffer's chain.
    pub fn buffer_fill(&mut self, buffer: &mut Buffer, size: usize, rank_set: RankSet) -> PoolResult<()> {
        if size == 0 {
            return Err(PoolError::Param("fill size must be > 0".into()));
        }
        let prior_top = buffer.segment();
        let seg_id = match self.find_free_seg(size) {
            Some(id) => id,
            None => self.new_seg(rank_set, size),
        };
        self.segs[seg_id].core.rank_set = rank_set;
        self.segs[seg_id].next = prior_top;
        let base = self.segs[seg_id].core.base;
        let limit = self.segs[seg_id].core.limit;
        buffer.attach(seg_id, base, limit);
        Ok(())
    }

    /// `sncSegBufferEmpty`: pad the unused tail so a later walk sees one
    /// placeholder object there.
    pub fn buffer_empty(&mut self, buffer: &mut Buffer, format: &dyn Format, shield: &dyn Shield) -> PoolResult<()> {
        let (seg_id, init, limit) = buffer.detach().ok_or(PoolError::Fail)?;
        if init < limit {
            shield.expose(seg_id);
            format.pad(init, limit - init);
            shield.cover(seg_id);
        }
        self.segs[seg_id].padded_limit = Some(limit);
        self.pool_gen.account_for_empty(init - self.segs[seg_id].core.base, limit - init);
        Ok(())
    }

    /// `sncRecordFreeSeg`: pad the whole segment and prepend it to the
    /// freelist.
    fn record_free_seg(&mut self, seg_id: SegId, format: &dyn Format, shield: &dyn Shield) {
        let seg = &self.segs[seg_id];
        let (base, limit) = (seg.core.base, seg.core.limit);
        shield.expose(seg_id);
        format.pad(base, limit - base);
        shield.cover(seg_id);
        let seg = &mut self.segs[seg_id];
        seg.core.grey = Default::default();
        seg.core.white = Default::default();
        seg.core.rank_set = RankSet::EMPTY;
        seg.padded_limit = Some(limit);
        seg.next = self.free_segs;
        self.free_segs = Some(seg_id);
    }

    /// `sncPopPartialSegChain`: pop and free every segment from `top`
    /// (inclusive) up to but excluding `up_to`.
    fn pop_partial_chain(&mut self, top: SegId, up_to: Option<SegId>, format: &dyn Format, shield: &dyn Shield) {
        let mut cur = Some(top);
        while let Some(id) = cur {
            if Some(id) == up_to {
                break;
            }
            let next = self.segs[id].next;
            self.record_free_seg(id, format, shield);
            cur = next;
        }
    }

    /// Half-open on `limit`: an address exactly at a segment's limit
    /// belongs to nothing, never ambiguously to the next segment — the
    /// same half-open convention that makes `frame_push`'s
    /// refill-before-ambiguous-push necessary in the first place.
    fn seg_of_addr(&self, addr: usize) -> Option<SegId> {
        self.segs.iter().position(|s| s.core.base <= addr && addr < s.core.limit)
    }

    /// `SNCFramePush`. Returns `None` for a null frame (buffer reset),
    /// otherwise the frame pointer to later pass to `frame_pop`.
    pub fn frame_push(&mut self, buffer: &mut Buffer, refill_size: usize, rank_set: RankSet) -> PoolResult<Option<usize>> {
        if buffer.is_reset() {
            return Ok(None);
        }
        let seg_id = buffer.segment().unwrap();
        let init = buffer.init().unwrap();
        let seg_limit = self.segs[seg_id].core.limit;
        if init < seg_limit {
            return Ok(Some(init));
        }
        // job003882: init == seg_limit is ambiguous with the next
        // segment's base. Refill before handing back a frame pointer.
        #[cfg(feature = "gc_logging")]
        tracing::trace!(seg = seg_id, "snc: frame push landed on segment limit, refilling eagerly");
        self.buffer_fill(buffer, refill_size, rank_set)?;
        Ok(Some(buffer.init().unwrap()))
    }

    /// `SNCFramePop`. `frame = None` pops the buffer's entire chain.
    pub fn frame_pop(&mut self, buffer: &mut Buffer, frame: Option<usize>, format: &dyn Format, shield: &dyn Shield) -> PoolResult<()> {
        let Some(cur_seg) = buffer.segment() else {
            return Ok(());
        };
        match frame {
            None => {
                self.pop_partial_chain(cur_seg, None, format, shield);
                buffer.detach();
            }
            Some(addr) => {
                let target = self.seg_of_addr(addr).ok_or(PoolError::Param("frame address not in any segment".into()))?;
                if target == cur_seg {
                    buffer.set_alloc(addr);
                } else {
                    self.pop_partial_chain(cur_seg, Some(target), format, shield);
                    let (base, limit) = (self.segs[target].core.base, self.segs[target].core.limit);
                    self.segs[target].padded_limit = None;
                    buffer.attach_at(target, base, limit, addr, 0);
                }
            }
        }
        Ok(())
    }

    /// Scan `[base, content_limit)` as one contiguous format area
    /// (`sncSegScan` — SNC has no per-object colour bookkeeping so there's
    /// nothing to gain from iterating objects one at a time here).
    pub fn scan(&self, seg_id: SegId, live_scan_limit: Option<usize>, ss: &mut ScanState, format: &dyn Format) -> PoolResult<()> {
        let seg = &self.segs[seg_id];
        let limit = seg.content_limit(live_scan_limit);
        if seg.core.base < limit {
            format.scan(ss, seg.core.base, limit)?;
        }
        Ok(())
    }

    /// Walk live objects, skipping any segment with a non-empty grey set
    /// (it may still reference old-space during another pool's copying
    /// collection — `sncSegWalk`).
    pub fn walk(&self, seg_id: SegId, live_scan_limit: Option<usize>, format: &dyn Format, mut visit: impl FnMut(usize)) {
        let seg = &self.segs[seg_id];
        if !seg.core.grey.is_empty() {
            return;
        }
        let limit = seg.content_limit(live_scan_limit);
        let mut addr = seg.core.base;
        while addr < limit {
            visit(addr);
            addr = format.skip(addr);
        }
    }

    pub fn total_size(&self) -> usize {
        self.segs.iter().map(|s| s.core.size()).sum()
    }

    pub fn free_size(&self) -> usize {
        let mut total = 0usize;
        let mut cur = self.free_segs;
        while let Some(id) = cur {
            total += self.segs[id].core.size();
            cur = self.segs[id].next;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shield::NullShield;

    struct NopFormat {
        pad_calls: std::cell::RefCell<Vec<(usize, usize)>>,
    }

    impl Format for NopFormat {
        fn header_size(&self) -> usize {
            0
        }
        fn alignment(&self) -> usize {
            16
        }
        fn skip(&self, obj: usize) -> usize {
            obj + 16
        }
        fn scan(&self, _ss: &mut ScanState, _base: usize, _limit: usize) -> PoolResult<()> {
            Ok(())
        }
        fn pad(&self, addr: usize, size: usize) {
            self.pad_calls.borrow_mut().push((addr, size));
        }
    }

    #[test]
    fn frame_push_refills_when_init_equals_seg_limit() {
        let mut pool = SncPool::new(16);
        let mut buf = Buffer::new(RankSet::EMPTY);
        pool.buffer_fill(&mut buf, 32, RankSet::EMPTY).unwrap();
        let first_seg = buf.segment().unwrap();
        buf.reserve(32).unwrap();
        buf.commit().unwrap(); // init now equals the segment limit exactly

        let frame = pool.frame_push(&mut buf, 32, RankSet::EMPTY).unwrap();
        assert_ne!(buf.segment(), Some(first_seg));
        assert_eq!(frame, buf.init());
        assert_eq!(pool.seg(buf.segment().unwrap()).next, Some(first_seg));
    }

    #[test]
    fn frame_pop_in_place_rewinds_without_freeing() {
        let mut pool = SncPool::new(16);
        let mut buf = Buffer::new(RankSet::EMPTY);
        pool.buffer_fill(&mut buf, 64, RankSet::EMPTY).unwrap();
        let frame = pool.frame_push(&mut buf, 64, RankSet::EMPTY).unwrap();
        buf.reserve(16).unwrap();
        buf.commit().unwrap();

        let format = NopFormat { pad_calls: Default::default() };
        let shield = NullShield;
        pool.frame_pop(&mut buf, frame, &format, &shield).unwrap();
        assert_eq!(buf.init(), frame);
        assert!(format.pad_calls.borrow().is_empty());
    }

    #[test]
    fn frame_pop_across_segments_frees_popped_ones() {
        let mut pool = SncPool::new(16);
        let mut buf = Buffer::new(RankSet::EMPTY);
        pool.buffer_fill(&mut buf, 16, RankSet::EMPTY).unwrap();
        let frame0 = pool.frame_push(&mut buf, 16, RankSet::EMPTY).unwrap();
        buf.reserve(16).unwrap();
        buf.commit().unwrap();
        // Force a new segment.
        pool.buffer_fill(&mut buf, 16, RankSet::EMPTY).unwrap();
        buf.reserve(16).unwrap();
        buf.commit().unwrap();

        let format = NopFormat { pad_calls: Default::default() };
        let shield = NullShield;
        pool.frame_pop(&mut buf, frame0, &format, &shield).unwrap();
        assert_eq!(pool.free_size() > 0, true);
        assert!(!format.pad_calls.borrow().is_empty());
    }

    #[test]
    fn walk_skips_grey_segments() {
        let mut pool = SncPool::new(16);
        let mut buf = Buffer::new(RankSet::EMPTY);
        pool.buffer_fill(&mut buf, 32, RankSet::EMPTY).unwrap();
        buf.reserve(32).unwrap();
        buf.commit().unwrap();
        let seg_id = buf.segment().unwrap();
        pool.seg_mut(seg_id).core.grey = pool.seg_mut(seg_id).core.grey.add(crate::rank::TraceId(0));

        let format = NopFormat { pad_calls: Default::default() };
        let mut visited = 0;
        pool.walk(seg_id, buf.scan_limit(), &format, |_| visited += 1);
        assert_eq!(visited, 0);
    }
}
