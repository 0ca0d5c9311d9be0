//! AWL: automatic weak-linked pool (spec.md §4.5).
//!
//! Non-moving, single rank per segment (exact or weak), no split/merge.
//! Two features AMS doesn't have: objects are stamped black the instant
//! they're allocated (buffer fill doesn't wait for a whiten to colour
//! them), and a dependent-object hook lets one object's scan force a
//! second ("dependent") object's summary to `UNIV` rather than track it
//! precisely — the mechanism behind weak-key table scanning.

use crate::bit_table::BitTable;
use crate::buffer::Buffer;
use crate::error::{PoolError, PoolResult};
use crate::format::Format;
use crate::pool_gen::PoolGen;
use crate::rank::{Rank, RankSet, TraceId, TraceSet};
use crate::segment::{GrainLayout, SegCore, Summary};
use crate::shield::{SegId, Shield};
use crate::trace::ScanState;
use rustc_hash::FxHashMap;

/// A ready-made `find_dependent` table for the common case (weak-key
/// tables register their dependent value object explicitly, rather than
/// the pool deriving it structurally). Keyed by object address.
#[derive(Debug, Default)]
pub struct DependentMap(FxHashMap<usize, SegId>);

impl DependentMap {
    pub fn new() -> Self {
        DependentMap::default()
    }

    pub fn register(&mut self, object: usize, dependent_seg: SegId) {
        self.0.insert(object, dependent_seg);
    }

    pub fn deregister(&mut self, object: usize) {
        self.0.remove(&object);
    }

    pub fn lookup(&self, object: usize) -> Option<SegId> {
        self.0.get(&object).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colour {
    Free,
    White,
    Grey,
    Black,
}

/// Per-pool single-access budget (spec.md §9 "Global mutable state":
/// `AWLSegSALimit`/`AWLTotalSALimit` become config, not module statics).
#[derive(Debug, Clone, Copy)]
pub struct AwlLimits {
    pub seg_sa_limit: Option<usize>,
    pub total_sa_limit: Option<usize>,
}

impl Default for AwlLimits {
    fn default() -> Self {
        // AWL_SEG_SA_LIMIT's documented default (spec.md "Access"
        // scenario). total_sa_limit has no value pinned by the spec; kept
        // generous so the per-segment limit is normally the binding one.
        AwlLimits { seg_sa_limit: Some(3), total_sa_limit: Some(0x1000) }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AwlStats {
    pub good_scans: usize,
    pub bad_scans: usize,
    pub saved_scans: usize,
    pub saved_accesses: usize,
    pub declined: usize,
}

#[derive(Debug, Clone, Copy)]
struct BufferView {
    scan_limit: usize,
    limit: usize,
}

pub struct AwlSeg {
    pub core: SegCore,
    layout: GrainLayout,
    grains: usize,
    alloc: BitTable,
    mark: BitTable,
    scanned: BitTable,
    free_grains: usize,
    buffered_grains: usize,
    new_grains: usize,
    old_grains: usize,
    single_accesses: usize,
    buffer_view: Option<BufferView>,
}

impl AwlSeg {
    pub fn new(id: SegId, base: usize, size: usize, rank: Rank, layout: GrainLayout) -> Self {
        let grains = layout.grains(size);
        AwlSeg {
            core: SegCore::new(id, base, base + size, RankSet::single(rank)),
            layout,
            grains,
            alloc: BitTable::new(grains),
            mark: BitTable::new(grains),
            scanned: BitTable::new(grains),
            free_grains: grains,
            buffered_grains: 0,
            new_grains: 0,
            old_grains: 0,
            single_accesses: 0,
            buffer_view: None,
        }
    }

    pub fn grains(&self) -> usize {
        self.grains
    }

    pub fn rank(&self) -> Rank {
        if self.core.rank_set.is_member(Rank::Weak) { Rank::Weak } else { Rank::Exact }
    }

    pub fn check_partition(&self) {
        debug_assert_eq!(
            self.free_grains + self.buffered_grains + self.new_grains + self.old_grains,
            self.grains
        );
    }

    fn colour_of(&self, i: usize) -> Colour {
        if !self.alloc.get(i) {
            Colour::Free
        } else if !self.mark.get(i) {
            Colour::White
        } else if !self.scanned.get(i) {
            Colour::Grey
        } else {
            Colour::Black
        }
    }

    fn is_allocated(&self, i: usize) -> bool {
        self.alloc.get(i)
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer_view.is_some()
    }

    // -- bufferFill (spec.md §4.5 "Buffer fill") --------------------------

    pub fn try_alloc(&mut self, n: usize) -> Option<(usize, usize)> {
        if self.free_grains < n {
            return None;
        }
        self.alloc.find_long_reset_range(0, self.grains, n)
    }

    /// Commit the range and stamp it black immediately — AWL objects are
    /// reachable as soon as they're allocated regardless of trace phase
    /// (poolawl.c's `AWLBufferFill`, which flags this with a source
    /// comment wondering whether it should depend on trace phase; kept
    /// faithfully rather than "fixed").
    pub fn commit_alloc(&mut self, i: usize, j: usize) {
        self.alloc.set_range(i, j);
        self.mark.set_range(i, j);
        self.scanned.set_range(i, j);
        let n = j - i;
        debug_assert!(self.free_grains >= n);
        self.free_grains -= n;
        self.buffered_grains += n;
        self.check_partition();
    }

    pub fn attach_buffer(&mut self, scan_limit: usize, limit: usize) {
        self.buffer_view = Some(BufferView { scan_limit, limit });
    }

    // -- bufferEmpty --------------------------------------------------------

    pub fn buffer_empty(&mut self, init_idx: usize, limit_idx: usize) {
        debug_assert!(init_idx <= limit_idx);
        let unused = limit_idx - init_idx;
        self.buffer_view = None;
        if unused > 0 {
            self.alloc.reset_range(init_idx, limit_idx);
            self.mark.reset_range(init_idx, limit_idx);
            self.scanned.reset_range(init_idx, limit_idx);
        }
        debug_assert!(self.buffered_grains >= unused);
        let used = self.buffered_grains - unused;
        self.free_grains += unused;
        self.buffered_grains = 0;
        self.new_grains += used;
        self.check_partition();
    }

    // -- whiten (spec.md §4.5 "Whiten") --------------------------------------

    pub fn whiten(&mut self, trace: TraceId) -> bool {
        debug_assert!(!self.core.white.is_member(trace));
        let uncondemned = match self.buffer_view {
            None => {
                self.mark.reset_range(0, self.grains);
                self.scanned.reset_range(0, self.grains);
                0
            }
            Some(view) => {
                let scan_limit_idx = self.layout.index_of_addr(self.core.base, view.scan_limit);
                let limit_idx = self.layout.index_of_addr(self.core.base, view.limit);
                // Buffer's reserved range must already be black.
                debug_assert!(self.mark.is_set_range(scan_limit_idx, limit_idx));
                debug_assert!(self.scanned.is_set_range(scan_limit_idx, limit_idx));
                if scan_limit_idx > 0 {
                    self.mark.reset_range(0, scan_limit_idx);
                    self.scanned.reset_range(0, scan_limit_idx);
                }
                if limit_idx < self.grains {
                    self.mark.reset_range(limit_idx, self.grains);
                    self.scanned.reset_range(limit_idx, self.grains);
                }
                limit_idx - scan_limit_idx
            }
        };

        debug_assert!(self.buffered_grains >= uncondemned);
        let aged = self.buffered_grains - uncondemned;
        self.old_grains += aged + self.new_grains;
        self.buffered_grains = uncondemned;
        self.new_grains = 0;
        self.check_partition();

        if self.old_grains > 0 {
            self.core.white = self.core.white.add(trace);
            true
        } else {
            false
        }
    }

    pub fn grey(&mut self, trace: TraceId) {
        if self.core.white.is_member(trace) {
            return;
        }
        self.core.grey = self.core.grey.add(trace);
        match self.buffer_view {
            None => {
                self.mark.set_range(0, self.grains);
                self.scanned.reset_range(0, self.grains);
            }
            Some(view) => {
                let scan_limit_idx = self.layout.index_of_addr(self.core.base, view.scan_limit);
                let limit_idx = self.layout.index_of_addr(self.core.base, view.limit);
                if scan_limit_idx > 0 {
                    self.mark.set_range(0, scan_limit_idx);
                    self.scanned.reset_range(0, scan_limit_idx);
                }
                if limit_idx < self.grains {
                    self.mark.set_range(limit_idx, self.grains);
                    self.scanned.reset_range(limit_idx, self.grains);
                }
            }
        }
    }

    /// Drop residual grey to black without scanning (`AWLBlacken`).
    pub fn blacken(&mut self) {
        self.scanned.set_range(0, self.grains);
    }

    // -- scan (spec.md §4.5 "Scan") -------------------------------------------

    fn scan_all_objects(&self, traces: TraceSet) -> bool {
        traces.diff(self.core.white) != TraceSet::EMPTY
    }

    /// Scan the segment, invoking `dependent` for each object's dependent
    /// address (if any) before scanning it, exposing it via `shield` and
    /// forcing its summary to `UNIV` — the source's `awlScanObject`
    /// mechanics for weak-key tables.
    pub fn scan(
        &mut self,
        ss: &mut ScanState,
        format: &dyn Format,
        shield: &dyn Shield,
        find_dependent: &dyn Fn(usize) -> Option<SegId>,
        dependent_summary: &mut dyn FnMut(SegId),
    ) -> PoolResult<bool> {
        let total = self.scan_all_objects(ss.traces);
        loop {
            let mut any_scanned = false;
            let (buf_scan_limit, buf_limit) = match self.buffer_view {
                Some(view) => (
                    self.layout.index_of_addr(self.core.base, view.scan_limit),
                    self.layout.index_of_addr(self.core.base, view.limit),
                ),
                None => (self.grains, self.grains),
            };
            let mut i = 0usize;
            while i < self.grains {
                if i == buf_scan_limit && buf_scan_limit != buf_limit {
                    i = buf_limit;
                    continue;
                }
                if !self.is_allocated(i) {
                    i += 1;
                    continue;
                }
                let obj_addr = self.layout.addr_of_index(self.core.base, i);
                let obj_limit_addr = format.skip(obj_addr);
                let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
                if total || (self.mark.get(i) && !self.scanned.get(i)) {
                    if let Some(dep_seg) = find_dependent(obj_addr) {
                        shield.expose(dep_seg);
                        dependent_summary(dep_seg);
                        format.scan(ss, obj_addr, obj_limit_addr)?;
                        shield.cover(dep_seg);
                    } else {
                        format.scan(ss, obj_addr, obj_limit_addr)?;
                    }
                    self.scanned.set(i);
                    any_scanned = true;
                }
                i = j;
            }
            if total || !any_scanned {
                return Ok(total);
            }
        }
    }

    // -- fix (spec.md §4.5 "Fix") -----------------------------------------------

    pub fn fix(&mut self, trace: TraceSet, client_ref: usize, format: &dyn Format, rank: Rank) -> PoolResult<Option<usize>> {
        let header_size = format.header_size();
        if client_ref < self.core.base + header_size {
            return Ok(Some(client_ref));
        }
        let base = client_ref - header_size;
        if base < self.core.base || (base - self.core.base) % self.layout.alignment() != 0 {
            return Ok(Some(client_ref));
        }
        let i = self.layout.index_of_addr(self.core.base, base);
        if i >= self.grains {
            return Ok(Some(client_ref));
        }

        if rank == Rank::Ambig {
            if !self.is_allocated(i) {
                return Ok(Some(client_ref));
            }
            // Ambiguous references can't move AWL off its precise-rank
            // assumption; treat like exact for colouring purposes.
        } else if !self.is_allocated(i) {
            return Ok(Some(client_ref));
        }

        if matches!(self.colour_of(i), Colour::White) {
            if self.rank() == Rank::Weak {
                return Ok(Some(0)); // splat the dead weak reference
            }
            self.mark.set(i);
            self.core.grey = self.core.grey.union(trace);
        }
        Ok(Some(client_ref))
    }

    // -- reclaim (spec.md §4.5 "Reclaim") ---------------------------------------

    pub fn reclaim(&mut self, trace: TraceId, format: &dyn Format) -> usize {
        let mut reclaimed = 0usize;
        let mut i = 0usize;
        while i < self.grains {
            if !self.is_allocated(i) {
                i += 1;
                continue;
            }
            let obj_addr = self.layout.addr_of_index(self.core.base, i);
            let obj_limit_addr = format.skip(obj_addr);
            let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
            if self.mark.get(i) {
                debug_assert!(self.scanned.get(i));
                // Survives: re-stamp the whole body black in case fix only
                // set the first grain.
                self.mark.set_range(i, j);
                self.scanned.set_range(i, j);
            } else {
                self.alloc.reset_range(i, j);
                self.mark.reset_range(i, j);
                self.scanned.reset_range(i, j);
                reclaimed += j - i;
            }
            i = j;
        }
        debug_assert!(self.old_grains >= reclaimed);
        self.old_grains -= reclaimed;
        self.free_grains += reclaimed;
        self.core.white = self.core.white.del(trace);
        self.check_partition();
        reclaimed
    }

    pub fn is_entirely_free(&self) -> bool {
        self.free_grains == self.grains && self.buffer_view.is_none()
    }

    /// Walk black objects only, skipping the buffered range (`AWLWalk`).
    pub fn walk(&self, format: &dyn Format, mut visit: impl FnMut(usize)) {
        let (buf_scan_limit, buf_limit) = match self.buffer_view {
            Some(view) => (
                self.layout.index_of_addr(self.core.base, view.scan_limit),
                self.layout.index_of_addr(self.core.base, view.limit),
            ),
            None => (self.grains, self.grains),
        };
        let mut i = 0usize;
        while i < self.grains {
            if i == buf_scan_limit && buf_scan_limit != buf_limit {
                i = buf_limit;
                continue;
            }
            if !self.is_allocated(i) {
                i += 1;
                continue;
            }
            let obj_addr = self.layout.addr_of_index(self.core.base, i);
            let obj_limit_addr = format.skip(obj_addr);
            let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
            if self.mark.get(i) && self.scanned.get(i) {
                visit(obj_addr);
            }
            i = j;
        }
    }
}

/// `AWLCanTrySingleAccess` (spec.md §4.5 "Access"): the five-condition
/// gate deciding whether a barrier trap can be resolved by fixing just the
/// one accessed reference instead of scanning the whole segment.
pub fn can_try_single_access(seg: &AwlSeg, trace_flipped: bool, trace_band_is_weak: bool, limits: &AwlLimits, pool_total: usize) -> bool {
    if seg.rank() != Rank::Weak {
        return false;
    }
    if !trace_flipped {
        return false;
    }
    if trace_band_is_weak {
        return false;
    }
    if let Some(limit) = limits.seg_sa_limit {
        if seg.single_accesses >= limit {
            return false;
        }
    }
    if let Some(limit) = limits.total_sa_limit {
        if pool_total >= limit {
            return false;
        }
    }
    true
}

pub struct AwlPool {
    pub limits: AwlLimits,
    pub pool_gen: PoolGen,
    pub stats: AwlStats,
    succ_accesses: usize,
    segs: Vec<AwlSeg>,
    layout: GrainLayout,
}

impl AwlPool {
    pub fn new(alignment: usize, limits: AwlLimits) -> Self {
        AwlPool {
            limits,
            pool_gen: PoolGen::new(),
            stats: AwlStats::default(),
            succ_accesses: 0,
            segs: Vec::new(),
            layout: GrainLayout::new(alignment),
        }
    }

    pub fn layout(&self) -> GrainLayout {
        self.layout
    }

    pub fn segs(&self) -> &[AwlSeg] {
        &self.segs
    }

    pub fn seg(&self, id: SegId) -> &AwlSeg {
        &self.segs[id]
    }

    pub fn seg_mut(&mut self, id: SegId) -> &mut AwlSeg {
        &mut self.segs[id]
    }

    pub fn seg_ids(&self) -> impl Iterator<Item = SegId> + '_ {
        0..self.segs.len()
    }

    fn create_seg(&mut self, rank: Rank, size: usize) -> SegId {
        let id = self.segs.len();
        let base = id * (size.max(1)) + 0x1000_0000; // disjoint synthetic address space
        let seg = AwlSeg::new(id, base, size, rank, self.layout);
        self.segs.push(seg);
        id
    }

    /// `AWLBufferFill`: ring-search a non-buffered same-rank segment with
    /// enough free grains before creating a new one.
    pub fn buffer_fill(&mut self, buffer: &mut Buffer, size: usize, rank: Rank) -> PoolResult<()> {
        if size == 0 {
            return Err(PoolError::Param("fill size must be > 0".into()));
        }
        let n = self.layout.grains(size);
        for seg in self.segs.iter_mut() {
            if seg.rank() != rank || seg.has_buffer() {
                continue;
            }
            if let Some((i, j)) = seg.try_alloc(n) {
                seg.commit_alloc(i, j);
                let base = self.layout.addr_of_index(seg.core.base, i);
                let limit = self.layout.addr_of_index(seg.core.base, j);
                seg.attach_buffer(base, limit);
                buffer.attach(seg.core.id, base, limit);
                self.pool_gen.account_for_fill(limit - base);
                return Ok(());
            }
        }

        let seg_size = self.layout.size_of_grains(n).max(self.layout.alignment());
        let id = self.create_seg(rank, seg_size);
        let seg = self.seg_mut(id);
        let (i, j) = seg.try_alloc(n).ok_or(PoolError::Memory("new segment too small".into()))?;
        seg.commit_alloc(i, j);
        let seg_base = seg.core.base;
        let base = self.layout.addr_of_index(seg_base, i);
        let limit = self.layout.addr_of_index(seg_base, j);
        let seg = self.seg_mut(id);
        seg.attach_buffer(base, limit);
        buffer.attach(id, base, limit);
        self.pool_gen.account_for_fill(limit - base);
        Ok(())
    }

    pub fn buffer_empty(&mut self, buffer: &mut Buffer) -> PoolResult<()> {
        let (seg_id, init, limit) = buffer.detach().ok_or(PoolError::Fail)?;
        let base = self.seg(seg_id).core.base;
        let init_idx = self.layout.index_of_addr(base, init);
        let limit_idx = self.layout.index_of_addr(base, limit);
        let used = limit_idx - init_idx;
        let seg = self.seg_mut(seg_id);
        seg.buffer_empty(init_idx, limit_idx);
        let new_grains = seg.new_grains;
        self.pool_gen.account_for_empty(new_grains.min(used), used);
        Ok(())
    }

    pub fn whiten(&mut self, seg_id: SegId, trace: TraceId) {
        let seg = self.seg_mut(seg_id);
        let old_before = seg.old_grains;
        let new_before = seg.new_grains;
        let became_white = seg.whiten(trace);

        let moved_to_old = self.seg(seg_id).old_grains - old_before;
        if moved_to_old > 0 {
            let aged = moved_to_old.saturating_sub(new_before);
            self.pool_gen
                .account_for_age(self.layout.size_of_grains(aged), self.layout.size_of_grains(new_before));
        }
        if became_white {
            let condemned = self.layout.size_of_grains(self.seg(seg_id).old_grains);
            self.pool_gen.condemned(condemned);
        }
    }

    pub fn reclaim(&mut self, seg_id: SegId, trace: TraceId, format: &dyn Format) {
        let seg = self.seg_mut(seg_id);
        let old_before = seg.old_grains;
        let reclaimed_grains = seg.reclaim(trace, format);
        let reclaimed = self.layout.size_of_grains(reclaimed_grains);
        self.pool_gen.account_for_reclaim(reclaimed);

        let survived_grains = old_before.saturating_sub(reclaimed_grains);
        if survived_grains > 0 {
            self.pool_gen.survived(self.layout.size_of_grains(survived_grains));
        }
        if self.seg(seg_id).is_entirely_free() {
            let size = self.seg(seg_id).core.size();
            self.pool_gen.account_for_free(size, 0, 0);
        }
    }

    /// Barrier access handler (`AWLAccess`): try a single-access fix, fall
    /// back to a full segment scan and reset the streak counter.
    pub fn access(
        &mut self,
        seg_id: SegId,
        trace: TraceSet,
        client_ref: usize,
        format: &dyn Format,
        rank: Rank,
        trace_flipped: bool,
        trace_band_is_weak: bool,
    ) -> PoolResult<Option<usize>> {
        let total_sa = self.succ_accesses;
        let can_single =
            can_try_single_access(self.seg(seg_id), trace_flipped, trace_band_is_weak, &self.limits, total_sa);
        if can_single {
            self.seg_mut(seg_id).single_accesses += 1;
            self.succ_accesses += 1;
            self.stats.saved_scans += 1;
            let result = self.seg_mut(seg_id).fix(trace, client_ref, format, rank)?;
            self.stats.good_scans += 1;
            return Ok(result);
        }
        self.stats.bad_scans += 1;
        self.succ_accesses = 0;
        self.seg_mut(seg_id).single_accesses = 0;
        #[cfg(feature = "gc_logging")]
        tracing::debug!(seg = seg_id, "awl: single access declined, falling back to full fix");
        self.seg_mut(seg_id).fix(trace, client_ref, format, rank)
    }

    pub fn set_summary(&mut self, seg_id: SegId, summary: Summary) {
        self.seg_mut(seg_id).core.summary = summary;
    }

    pub fn total_size(&self) -> usize {
        self.pool_gen.total_size
    }

    pub fn free_size(&self) -> usize {
        self.pool_gen.free_size
    }
}
