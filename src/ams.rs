//! AMS: automatic mark-sweep pool (spec.md §4.3, §4.4).
//!
//! Non-moving, colour-table based. Optionally supports ambiguous
//! references; when it does not, `shareAllocTable` lets the alloc table
//! double as the nonwhite table during a collection cycle to save memory
//! (spec.md §9 "Shared allocation/nonwhite table" — reproduced as a
//! protocol on two booleans rather than literal storage aliasing, per the
//! design note's own preference for separate tables).

use crate::bit_table::BitTable;
use crate::buffer::Buffer;
use crate::error::{PoolError, PoolResult};
use crate::format::Format;
use crate::pool_gen::PoolGen;
use crate::rank::{Rank, RankSet, TraceId, TraceSet};
use crate::segment::{GrainLayout, SegCore, Summary};
use crate::shield::SegId;
use crate::trace::ScanState;

/// The colour of one grain, derived from the three bit tables
/// (spec.md §3 "Colour encoding (AMS)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colour {
    Free,
    White,
    Grey,
    Black,
}

/// Per-pool configuration, injected at construction rather than held in
/// module statics (spec.md §9 "Global mutable state").
#[derive(Debug, Clone, Copy)]
pub struct AmsConfig {
    /// Whether this pool accepts ambiguous (conservative) references.
    /// `shareAllocTable` is the negation of this.
    pub supports_ambiguous: bool,
}

impl AmsConfig {
    pub fn share_alloc_table(&self) -> bool {
        !self.supports_ambiguous
    }
}

/// The part of an attached buffer's state a segment needs to do its own
/// whiten/scan/reclaim bookkeeping, without owning the buffer itself
/// (spec.md §3 "Ownership": buffer holds a non-owning reference to its
/// segment; the segment tracks which buffer is attached).
#[derive(Debug, Clone, Copy)]
pub struct BufferView {
    pub scan_limit: usize,
    pub limit: usize,
}

/// An AMS segment: the colour-table bookkeeping around one grain-aligned
/// region of memory.
pub struct AmsSeg {
    pub core: SegCore,
    layout: GrainLayout,
    grains: usize,
    alloc: BitTable,
    nonwhite: BitTable,
    nongrey: BitTable,
    free_grains: usize,
    buffered_grains: usize,
    new_grains: usize,
    old_grains: usize,
    marks_changed: bool,
    ambiguous_fixes: bool,
    colour_tables_in_use: bool,
    /// False while the segment is in the cheap "firstFree" allocation
    /// mode; true once the alloc table has been materialised and is the
    /// authoritative allocation record.
    alloc_table_in_use: bool,
    first_free: usize,
    share_alloc_table: bool,
    buffer_view: Option<BufferView>,
}

impl AmsSeg {
    pub fn new(id: SegId, base: usize, size: usize, rank_set: RankSet, layout: GrainLayout, share_alloc_table: bool) -> Self {
        let grains = layout.grains(size);
        AmsSeg {
            core: SegCore::new(id, base, base + size, rank_set),
            layout,
            grains,
            alloc: BitTable::new(grains),
            // Default to black: a grain that's never been through a
            // whiten/fix cycle (freshly allocated, or still free) must
            // not read as white, since `colour_of` consults these tables
            // even when no trace has touched the segment yet.
            nonwhite: BitTable::new_set(grains),
            nongrey: BitTable::new_set(grains),
            free_grains: grains,
            buffered_grains: 0,
            new_grains: 0,
            old_grains: 0,
            marks_changed: false,
            ambiguous_fixes: false,
            colour_tables_in_use: false,
            alloc_table_in_use: false,
            first_free: 0,
            share_alloc_table,
            buffer_view: None,
        }
    }

    pub fn grains(&self) -> usize {
        self.grains
    }

    /// Invariant (I1): the four grain counts partition `grains`.
    pub fn check_partition(&self) {
        debug_assert_eq!(
            self.free_grains + self.buffered_grains + self.new_grains + self.old_grains,
            self.grains
        );
    }

    fn colour_of(&self, i: usize) -> Colour {
        if !self.alloc.get(i) {
            Colour::Free
        } else if !self.nonwhite.get(i) {
            Colour::White
        } else if !self.nongrey.get(i) {
            Colour::Grey
        } else {
            Colour::Black
        }
    }

    /// Invariant (I2): no allocated grain is both white and grey.
    pub fn check_colour_validity(&self) {
        if !self.colour_tables_in_use {
            return;
        }
        for i in 0..self.grains {
            if self.alloc.get(i) {
                let white = !self.nonwhite.get(i);
                let grey = self.alloc.get(i) && self.nonwhite.get(i) && !self.nongrey.get(i);
                debug_assert!(!(white && grey));
            }
        }
    }

    fn is_allocated(&self, i: usize) -> bool {
        self.alloc.get(i)
    }

    /// Materialise the alloc table from the cheap `firstFree` cursor, if
    /// still in that mode. Idempotent.
    fn ensure_alloc_table(&mut self) {
        if !self.alloc_table_in_use {
            self.alloc.set_range(0, self.first_free);
            self.alloc.reset_range(self.first_free, self.grains);
            self.alloc_table_in_use = true;
        }
    }

    // -- bufferFill (spec.md §4.4 "Buffer fill") --------------------------

    /// Attempt to allocate `n` grains for a buffer fill. Returns the grain
    /// range `[i, j)` on success.
    pub fn try_alloc(&mut self, n: usize) -> Option<(usize, usize)> {
        if self.core.white != TraceSet::EMPTY || self.core.grey != TraceSet::EMPTY {
            return None; // <design/poolams#.fill.colour>
        }
        if self.free_grains < n {
            return None;
        }
        if !self.alloc_table_in_use {
            if self.first_free + n <= self.grains {
                let i = self.first_free;
                return Some((i, i + n));
            }
            return None;
        }
        self.alloc.find_long_reset_range(0, self.grains, n)
    }

    /// Commit the range found by [`AmsSeg::try_alloc`]: mark it allocated
    /// and update the grain partition.
    pub fn commit_alloc(&mut self, i: usize, j: usize) {
        if !self.alloc_table_in_use {
            debug_assert_eq!(i, self.first_free);
            self.first_free = j;
        } else {
            self.alloc.set_range(i, j);
        }
        let n = j - i;
        debug_assert!(self.free_grains >= n);
        self.free_grains -= n;
        self.buffered_grains += n;
        self.check_partition();
    }

    pub fn attach_buffer(&mut self, scan_limit: usize, limit: usize) {
        self.buffer_view = Some(BufferView { scan_limit, limit });
    }

    // -- bufferEmpty (spec.md §4.4 "Buffer empty") ------------------------

    /// Return the unused tail `[init, limit)` of a buffer to the segment.
    /// `used`/`unused` are grain counts.
    pub fn buffer_empty(&mut self, init_idx: usize, limit_idx: usize) {
        debug_assert!(init_idx <= limit_idx);
        let unused = limit_idx - init_idx;
        self.buffer_view = None;

        if self.alloc_table_in_use {
            self.alloc.reset_range(init_idx, limit_idx);
        } else if init_idx < limit_idx && limit_idx == self.first_free {
            // Trimmed range is the tail of firstFree: just retract it.
            self.first_free = init_idx;
        } else if self.share_alloc_table && self.colour_tables_in_use {
            // .open-question: the alloc table is currently overloaded as
            // the nonwhite table and must not be consulted or updated for
            // AMS_ALLOCED in this window. Whiten the unused tail directly
            // in the colour tables instead; reclaim is solely responsible
            // for rebuilding alloc from nonwhite afterwards.
            if init_idx < limit_idx {
                self.nonwhite.reset_range(init_idx, limit_idx);
                self.nongrey.reset_range(init_idx, limit_idx);
            }
        } else {
            // Promote from firstFree mode to alloc-table mode.
            self.ensure_alloc_table();
            self.alloc.reset_range(init_idx, limit_idx);
        }

        debug_assert!(self.buffered_grains >= unused);
        let used = self.buffered_grains - unused;
        self.free_grains += unused;
        self.buffered_grains = 0;
        self.new_grains += used;
        self.check_partition();
    }

    // -- whiten / condemn (spec.md §4.4 "Whiten (condemn)") ---------------

    /// Condemn this segment for `trace`. Returns `true` if the segment was
    /// added to the trace's white set (there was something to collect).
    pub fn whiten(&mut self, trace: TraceId) -> bool {
        debug_assert!(!self.core.white.is_member(trace));
        debug_assert!(!self.colour_tables_in_use);

        self.colour_tables_in_use = true;
        self.ensure_alloc_table();
        if self.share_alloc_table {
            self.alloc_table_in_use = false;
        }

        let uncondemned = match self.buffer_view {
            None => {
                self.nonwhite.reset_range(0, self.grains);
                self.nongrey.reset_range(0, self.grains);
                0
            }
            Some(view) => {
                let scan_limit_idx = self.layout.index_of_addr(self.core.base, view.scan_limit);
                let limit_idx = self.layout.index_of_addr(self.core.base, view.limit);
                self.range_whiten(0, scan_limit_idx);
                // The buffer's reserved-but-uncommitted tail is black by
                // definition: blacken it rather than leave it grey/white.
                self.nonwhite.set_range(scan_limit_idx, limit_idx);
                self.nongrey.set_range(scan_limit_idx, limit_idx);
                self.range_whiten(limit_idx, self.grains);
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
            #[cfg(feature = "gc_logging")]
            tracing::trace!(seg = self.core.id, grains = self.old_grains, "ams: condemned segment");
            true
        } else {
            // Nothing to collect: undo colour-table activation.
            self.colour_tables_in_use = false;
            if self.share_alloc_table {
                self.alloc_table_in_use = true;
            }
            false
        }
    }

    fn range_whiten(&mut self, base: usize, limit: usize) {
        if base != limit {
            self.nonwhite.reset_range(base, limit);
            self.nongrey.reset_range(base, limit);
        }
    }

    /// Mark every non-white, non-buffer grain grey for `trace`.
    pub fn grey(&mut self, trace: TraceId) {
        if self.core.white.is_member(trace) {
            return;
        }
        self.core.grey = self.core.grey.add(trace);
        match self.buffer_view {
            None => {
                self.nonwhite.set_range(0, self.grains);
                self.nongrey.reset_range(0, self.grains);
            }
            Some(view) => {
                let scan_limit_idx = self.layout.index_of_addr(self.core.base, view.scan_limit);
                let limit_idx = self.layout.index_of_addr(self.core.base, view.limit);
                if scan_limit_idx > 0 {
                    self.nonwhite.set_range(0, scan_limit_idx);
                    self.nongrey.reset_range(0, scan_limit_idx);
                }
                if limit_idx < self.grains {
                    self.nonwhite.set_range(limit_idx, self.grains);
                    self.nongrey.reset_range(limit_idx, self.grains);
                }
            }
        }
    }

    // -- scan (spec.md §4.4 "Scan") ----------------------------------------

    /// True iff this scan must visit every object regardless of colour
    /// (the trace set being scanned is not a subset of the segment's
    /// white set).
    fn scan_all_objects(&self, traces: TraceSet) -> bool {
        traces.diff(self.core.white) != TraceSet::EMPTY
    }

    /// Scan the segment. Returns `total = true` iff every object was
    /// visited.
    pub fn scan(&mut self, ss: &mut ScanState, format: &dyn Format) -> PoolResult<bool> {
        let scan_all = self.scan_all_objects(ss.traces) || self.ambiguous_fixes;
        if scan_all {
            self.scan_all(ss, format)?;
            return Ok(true);
        }

        loop {
            self.marks_changed = false;
            let mut any = false;
            let mut i = 0usize;
            while i < self.grains {
                if matches!(self.colour_of(i), Colour::Grey) {
                    let j = self.scan_one_object(ss, format, i)?;
                    any = true;
                    i = j;
                } else {
                    i += 1;
                }
            }
            if self.ambiguous_fixes {
                // <design/poolams#.ambiguous.middle>: an ambiguous fix
                // landed mid-scan; the grey-only fast path is no longer
                // sound. Fall back to a full scan.
                self.scan_all(ss, format)?;
                return Ok(true);
            }
            if !self.marks_changed || !any {
                break;
            }
        }
        Ok(false)
    }

    fn scan_all(&mut self, ss: &mut ScanState, format: &dyn Format) -> PoolResult<()> {
        let (buffer_scan_limit, buffer_limit) = match self.buffer_view {
            Some(view) => (
                self.layout.index_of_addr(self.core.base, view.scan_limit),
                self.layout.index_of_addr(self.core.base, view.limit),
            ),
            None => (self.grains, self.grains),
        };
        let mut i = 0usize;
        while i < self.grains {
            if i == buffer_scan_limit && buffer_scan_limit != buffer_limit {
                i = buffer_limit;
                continue;
            }
            if !self.is_allocated(i) {
                i += 1;
                continue;
            }
            i = self.scan_one_object(ss, format, i)?;
        }
        Ok(())
    }

    /// Scan the object at grain `i`, blacken it and any intervening white
    /// grains in its body, and return the grain index just past it.
    fn scan_one_object(&mut self, ss: &mut ScanState, format: &dyn Format, i: usize) -> PoolResult<usize> {
        let obj_addr = self.layout.addr_of_index(self.core.base, i);
        let obj_limit_addr = format.skip(obj_addr);
        let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
        format.scan(ss, obj_addr, obj_limit_addr)?;
        self.nongrey.set(i);
        if j > i + 1 {
            self.nonwhite.set_range(i + 1, j);
            self.nongrey.set_range(i + 1, j);
        }
        Ok(j)
    }

    // -- fix (spec.md §4.4 "Fix") ------------------------------------------

    /// Per-reference colour transition. `client_ref` is the address the
    /// mutator/scanner sees (past the format header).
    pub fn fix(&mut self, ss: &mut ScanState, trace: TraceSet, client_ref: usize, format: &dyn Format) -> PoolResult<Option<usize>> {
        let header_size = format.header_size();
        if client_ref < self.core.base + header_size {
            return Ok(Some(client_ref)); // not a reference into this segment's live data
        }
        let base = client_ref - header_size;
        if base < self.core.base || (base - self.core.base) % self.layout.alignment() != 0 {
            return Ok(Some(client_ref));
        }
        let i = self.layout.index_of_addr(self.core.base, base);
        if i >= self.grains || !self.is_allocated(i) {
            return Ok(Some(client_ref));
        }

        if ss.rank == Rank::Ambig {
            if !self.share_alloc_table {
                self.ambiguous_fixes = true;
            } else {
                return Ok(Some(client_ref)); // pool doesn't support ambiguous refs
            }
        }

        if matches!(self.colour_of(i), Colour::White) {
            ss.was_marked = false;
            if ss.rank == Rank::Weak {
                return Ok(Some(0)); // splat
            }
            if self.core.rank_set.is_empty() && ss.rank != Rank::Ambig {
                // Single-rank segment with no ambiguous roots into it:
                // blacken in place rather than stop at grey.
                let obj_addr = self.layout.addr_of_index(self.core.base, i);
                let obj_limit_addr = format.skip(obj_addr);
                let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
                self.nonwhite.set_range(i, j);
                self.nongrey.set_range(i, j);
            } else {
                self.nonwhite.set(i);
                self.core.grey = self.core.grey.union(trace);
                self.marks_changed = true;
            }
        }
        Ok(Some(client_ref))
    }

    // -- blacken (spec.md §4.4 "Blacken") -----------------------------------

    /// Drop residual grey to black without scanning.
    pub fn blacken(&mut self, trace_set: TraceSet, format: &dyn Format) {
        if trace_set.inter(self.core.white).is_empty() {
            return;
        }
        debug_assert!(self.marks_changed);
        self.marks_changed = false;
        let mut i = 0usize;
        while i < self.grains {
            if !self.is_allocated(i) {
                i += 1;
                continue;
            }
            let obj_addr = self.layout.addr_of_index(self.core.base, i);
            let obj_limit_addr = format.skip(obj_addr);
            let j = self.layout.index_of_addr(self.core.base, obj_limit_addr);
            if matches!(self.colour_of(i), Colour::Grey) {
                // amsSegBlackenObject: header grain only needs nongrey
                // (it's already nonwhite, having been greyed); the body
                // grains need both tables set, same as whiten's
                // range-blacken of a buffer's reserved tail.
                self.nongrey.set(i);
                if j > i + 1 {
                    self.nonwhite.set_range(i + 1, j);
                    self.nongrey.set_range(i + 1, j);
                }
            }
            i = j;
        }
    }

    // -- reclaim (spec.md §4.4 "Reclaim") -----------------------------------

    /// Reclaim white grains. Returns the number of grains reclaimed.
    pub fn reclaim(&mut self, trace: TraceId) -> usize {
        debug_assert!(!self.marks_changed);
        let now_free = self.nonwhite.count_reset_range(0, self.grains);
        self.colour_tables_in_use = false;

        if self.share_alloc_table {
            // The alloc table was left unmaintained for the duration of
            // the cycle (`.open-question`); rebuild it from nonwhite.
            self.alloc.copy_range(&self.nonwhite, 0, self.grains);
        } else {
            // alloc was maintained throughout; drop exactly the grains
            // that turned out to be garbage (alloc && !nonwhite).
            self.alloc.and_with(&self.nonwhite);
        }
        self.alloc_table_in_use = true;

        let reclaimed = now_free.saturating_sub(self.free_grains);
        debug_assert!(self.old_grains >= reclaimed);
        self.old_grains -= reclaimed;
        self.free_grains += reclaimed;
        self.core.white = self.core.white.del(trace);
        self.check_partition();
        #[cfg(feature = "gc_logging")]
        tracing::debug!(seg = self.core.id, reclaimed, "ams: reclaimed grains");
        reclaimed
    }

    /// Walk live (non-white) objects, skipping the buffered range
    /// (mirrors `AWLWalk`'s shape for AMS).
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
            if !matches!(self.colour_of(i), Colour::White) {
                visit(obj_addr);
            }
            i = j;
        }
    }

    /// True iff the segment is entirely free and has no buffer attached
    /// (a candidate for release to the generation).
    pub fn is_entirely_free(&self) -> bool {
        self.free_grains == self.grains && self.buffer_view.is_none()
    }

    // -- split / merge (spec.md §4.3) ---------------------------------------

    /// Split this segment at grain `mid`, returning the new high segment.
    /// Preconditions (spec.md §4.3): the high half is entirely free, `mid`
    /// is grain-aligned (trivially true, indices are grains already), and
    /// colour tables are not in use (or both halves would be white-free).
    pub fn split(&mut self, new_id: SegId, mid: usize) -> PoolResult<AmsSeg> {
        if mid == 0 || mid >= self.grains {
            return Err(PoolError::Param("split point out of range".into()));
        }
        let high_grains = self.grains - mid;
        if self.free_grains < high_grains || self.colour_tables_in_use {
            return Err(PoolError::Fail);
        }

        // Allocate the new half's tables before mutating self, so a
        // future fallible step here would leave both halves untouched
        // (the `.alloc-early` rule from the source).
        let mut high = AmsSeg::new(
            new_id,
            self.layout.addr_of_index(self.core.base, mid),
            self.layout.size_of_grains(high_grains),
            self.core.rank_set,
            self.layout,
            self.share_alloc_table,
        );

        // allocTable: reset-ranged (the high half starts with nothing
        // marked allocated; it was verified entirely free above).
        high.alloc.reset_range(0, high_grains);
        // nongreyTable / nonwhiteTable: set-ranged for the new side,
        // matching `SPLIT_TABLES`'s per-table semantics.
        high.nongrey.set_range(0, high_grains);
        high.nonwhite.set_range(0, high_grains);

        high.free_grains = high_grains;
        high.buffered_grains = 0;
        high.new_grains = 0;
        high.old_grains = 0;
        high.alloc_table_in_use = self.alloc_table_in_use;
        high.first_free = if self.alloc_table_in_use { 0 } else { high_grains };

        self.core.limit = self.layout.addr_of_index(self.core.base, mid);
        self.grains = mid;
        if !self.alloc_table_in_use {
            self.first_free = self.first_free.min(mid);
        }
        self.free_grains -= high_grains;
        self.check_partition();
        high.check_partition();

        Ok(high)
    }

    /// Merge `high` (immediately following this segment) into this
    /// segment. Precondition: `high` is entirely free.
    pub fn merge(&mut self, high: AmsSeg) -> PoolResult<()> {
        if !high.is_entirely_free() || self.colour_tables_in_use || high.colour_tables_in_use {
            return Err(PoolError::Fail);
        }
        let low_grains = self.grains;
        let high_grains = high.grains;
        let total = low_grains + high_grains;

        let mut alloc = BitTable::new(total);
        let mut nonwhite = BitTable::new(total);
        let mut nongrey = BitTable::new(total);
        alloc.copy_range(&self.alloc, 0, low_grains);
        nonwhite.copy_range(&self.nonwhite, 0, low_grains);
        nongrey.copy_range(&self.nongrey, 0, low_grains);
        // High half is entirely free: reset alloc, set colour tables over
        // its range (mirrors the inverse of split's SPLIT_TABLES step).
        alloc.reset_range(low_grains, total);
        nongrey.set_range(low_grains, total);
        nonwhite.set_range(low_grains, total);

        self.alloc = alloc;
        self.nonwhite = nonwhite;
        self.nongrey = nongrey;
        self.grains = total;
        self.core.limit = high.core.limit;
        self.free_grains += high_grains;
        if !self.alloc_table_in_use {
            self.first_free = self.first_free.min(low_grains);
        }
        self.check_partition();
        Ok(())
    }
}

/// The AMS pool: owns its segments and a generation accounting handle.
pub struct AmsPool {
    pub config: AmsConfig,
    pub pool_gen: PoolGen,
    segs: Vec<AmsSeg>,
    layout: GrainLayout,
}

impl AmsPool {
    pub fn new(alignment: usize, config: AmsConfig) -> Self {
        AmsPool {
            config,
            pool_gen: PoolGen::new(),
            segs: Vec::new(),
            layout: GrainLayout::new(alignment),
        }
    }

    pub fn layout(&self) -> GrainLayout {
        self.layout
    }

    pub fn segs(&self) -> &[AmsSeg] {
        &self.segs
    }

    pub fn seg(&self, id: SegId) -> &AmsSeg {
        &self.segs[id]
    }

    pub fn seg_mut(&mut self, id: SegId) -> &mut AmsSeg {
        &mut self.segs[id]
    }

    pub fn seg_ids(&self) -> impl Iterator<Item = SegId> + '_ {
        0..self.segs.len()
    }

    fn create_seg(&mut self, rank_set: RankSet, size: usize) -> SegId {
        let id = self.segs.len();
        let base = id * (size.max(1)); // synthetic disjoint address space for tests
        let seg = AmsSeg::new(id, base, size, rank_set, self.layout, self.config.share_alloc_table());
        self.segs.push(seg);
        id
    }

    /// `bufferFill` (spec.md §4.4): find or create a segment with room for
    /// `size` bytes and attach `buffer` to it.
    pub fn buffer_fill(&mut self, buffer: &mut Buffer, size: usize) -> PoolResult<()> {
        if size == 0 {
            return Err(PoolError::Param("fill size must be > 0".into()));
        }
        let n = self.layout.grains(size);
        for seg in self.segs.iter_mut() {
            if seg.core.rank_set != buffer.rank_set() {
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
        let id = self.create_seg(buffer.rank_set(), seg_size);
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

    /// `bufferEmpty` (spec.md §4.4): reclaim the buffer's tail.
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

    /// `whiten`: condemn `seg` for `trace`.
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

    /// `reclaim`: free white grains in `seg`, releasing it to the
    /// generation if it becomes entirely empty.
    pub fn reclaim(&mut self, seg_id: SegId, trace: TraceId) {
        let seg = self.seg_mut(seg_id);
        let old_before = seg.old_grains;
        let reclaimed_grains = seg.reclaim(trace);
        let reclaimed = self.layout.size_of_grains(reclaimed_grains);
        self.pool_gen.account_for_reclaim(reclaimed);

        let survived_grains = old_before.saturating_sub(reclaimed_grains);
        if survived_grains > 0 {
            self.pool_gen.survived(self.layout.size_of_grains(survived_grains));
        }
        if self.seg(seg_id).is_entirely_free() {
            let seg = self.seg(seg_id);
            let size = seg.core.size();
            self.pool_gen.account_for_free(size, 0, 0);
        }
    }

    pub fn total_size(&self) -> usize {
        self.pool_gen.total_size
    }

    pub fn free_size(&self) -> usize {
        self.pool_gen.free_size
    }

    /// Summary field, separately settable by a barrier (spec.md §3).
    pub fn set_summary(&mut self, seg_id: SegId, summary: Summary) {
        self.seg_mut(seg_id).core.summary = summary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::Rank;

    struct NopFormat {
        header_size: usize,
        alignment: usize,
        obj_grains: usize,
    }

    impl Format for NopFormat {
        fn header_size(&self) -> usize {
            self.header_size
        }
        fn alignment(&self) -> usize {
            self.alignment
        }
        fn skip(&self, obj: usize) -> usize {
            obj + self.obj_grains * self.alignment - self.header_size
        }
        fn scan(&self, _ss: &mut ScanState, _base: usize, _limit: usize) -> PoolResult<()> {
            Ok(())
        }
        fn pad(&self, _addr: usize, _size: usize) {}
    }

    fn config(share: bool) -> AmsConfig {
        AmsConfig { supports_ambiguous: !share }
    }

    #[test]
    fn buffer_fill_and_empty_round_trip() {
        let mut pool = AmsPool::new(16, config(true));
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 160).unwrap();
        assert_eq!(pool.seg(0).free_grains, 0);
        buf.reserve(32).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf).unwrap();
        assert!(buf.is_reset());
        let seg = pool.seg(0);
        assert_eq!(seg.new_grains, 2);
        assert_eq!(seg.free_grains, 8);
        seg.check_partition();
    }

    #[test]
    fn whiten_with_no_buffer_condemns_whole_segment() {
        let mut pool = AmsPool::new(16, config(true));
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 160).unwrap();
        buf.reserve(160).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf).unwrap();

        pool.whiten(0, TraceId(0));
        let seg = pool.seg(0);
        assert!(seg.core.white.is_member(TraceId(0)));
        assert_eq!(seg.old_grains, 10);
    }

    #[test]
    fn fix_on_white_exact_reference_greys_segment() {
        let mut pool = AmsPool::new(16, config(true));
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 160).unwrap();
        let addr = buf.reserve(16).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf).unwrap();
        pool.whiten(0, TraceId(0));

        let format = NopFormat { header_size: 0, alignment: 16, obj_grains: 1 };
        let seg = pool.seg_mut(0);
        let mut fixer = |_r: &mut usize, _rank: Rank, _wm: &mut bool| Ok(());
        let mut ss = ScanState::new(TraceSet::EMPTY.add(TraceId(0)), Rank::Exact, &mut fixer);
        let result = seg.fix(&mut ss, TraceSet::EMPTY.add(TraceId(0)), addr, &format).unwrap();
        assert_eq!(result, Some(addr));
        // The segment has a non-empty rank set (inherited from the
        // buffer), so fix greys it rather than blackening in place; either
        // way it must not stay white.
        assert!(!matches!(seg.colour_of(0), Colour::White));
    }

    #[test]
    fn weak_fix_on_white_splats() {
        let mut pool = AmsPool::new(16, config(true));
        let mut buf = Buffer::new(RankSet::single(Rank::Weak));
        pool.buffer_fill(&mut buf, 160).unwrap();
        let addr = buf.reserve(16).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf).unwrap();
        pool.whiten(0, TraceId(0));

        let format = NopFormat { header_size: 0, alignment: 16, obj_grains: 1 };
        let seg = pool.seg_mut(0);
        let mut fixer = |_r: &mut usize, _rank: Rank, _wm: &mut bool| Ok(());
        let mut ss = ScanState::new(TraceSet::EMPTY.add(TraceId(0)), Rank::Weak, &mut fixer);
        let result = seg.fix(&mut ss, TraceSet::EMPTY.add(TraceId(0)), addr, &format).unwrap();
        assert_eq!(result, Some(0));
    }

    #[test]
    fn split_then_merge_round_trips_grain_counts() {
        let mut seg = AmsSeg::new(0, 0, 320, RankSet::EMPTY, GrainLayout::new(16), true);
        let high = seg.split(1, 10).unwrap();
        assert_eq!(seg.grains(), 10);
        assert_eq!(high.grains(), 10);
        seg.merge(high).unwrap();
        assert_eq!(seg.grains(), 20);
        assert_eq!(seg.free_grains, 20);
    }

    #[test]
    fn reclaim_restores_free_grains_after_whiten() {
        let mut pool = AmsPool::new(16, config(true));
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 160).unwrap();
        buf.reserve(160).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf).unwrap();
        pool.whiten(0, TraceId(0));
        assert_eq!(pool.seg(0).old_grains, 10);
        pool.reclaim(0, TraceId(0));
        assert_eq!(pool.seg(0).free_grains, 10);
        assert_eq!(pool.seg(0).old_grains, 0);
    }
}
