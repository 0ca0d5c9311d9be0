//! Heap, pool, and root walking (spec.md §4.7).
//!
//! All three are variations on the same theme: visit every live object
//! reachable through some collection of segments without running a real
//! trace. The original's `ArenaFormattedObjectsWalk` exposes each segment
//! in turn and calls the pool class's own walk method; a pool walk is the
//! same operation scoped to one pool, and a root walk has no segments at
//! all, so it's left as a thin call-through to the client's own root
//! enumeration (roots are an out-of-scope collaborator — spec.md §1).
//!
//! Callers are expected to have parked the arena (no trace in progress,
//! every buffer flushed) before walking, exactly as
//! `mps_arena_formatted_objects_walk` requires of its caller.

use crate::error::PoolResult;
use crate::format::Format;
use crate::pool::Pool;
use crate::shield::{SegId, Shield};
use crate::trace::ScanState;

/// Visit every live object in `pool`, exposing each segment around the
/// visit so the shield's protection is respected (`ArenaFormattedObjectsWalk`
/// scoped to one pool — this is both the "heap walk" and "pool walk"
/// operation; a true heap walk is just this called once per pool in the
/// arena, which lives outside this crate's scope).
pub fn formatted_objects_walk(pool: &Pool, format: &dyn Format, shield: &dyn Shield, mut visit: impl FnMut(SegId, usize)) {
    match pool {
        Pool::Ams(p) => {
            for id in p.seg_ids() {
                shield.expose(id);
                p.seg(id).walk(format, |addr| visit(id, addr));
                shield.cover(id);
            }
        }
        Pool::Awl(p) => {
            for id in p.seg_ids() {
                shield.expose(id);
                p.seg(id).walk(format, |addr| visit(id, addr));
                shield.cover(id);
            }
        }
        Pool::Snc(p) => {
            for id in p.seg_ids() {
                shield.expose(id);
                p.walk(id, None, format, |addr| visit(id, addr));
                shield.cover(id);
            }
        }
    }
}

/// The client's root enumeration, called with a synthesized scan state
/// exactly as if it were scanning a segment (spec.md §4.7 "Root walk").
/// Root storage and enumeration belong to the out-of-scope arena; this
/// trait is the seam the pool machinery's walk/scan plumbing exposes to
/// it.
pub trait RootWalk {
    fn scan_roots(&self, ss: &mut ScanState) -> PoolResult<()>;
}

/// Drive one root walk. A one-line call-through, kept as a named function
/// so callers compose it the same way as [`formatted_objects_walk`]
/// rather than calling the trait method directly.
pub fn root_walk(roots: &dyn RootWalk, ss: &mut ScanState) -> PoolResult<()> {
    roots.scan_roots(ss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ams::AmsConfig;
    use crate::buffer::Buffer;
    use crate::rank::{Rank, RankSet, TraceSet};
    use crate::shield::NullShield;

    struct NopFormat {
        alignment: usize,
    }

    impl Format for NopFormat {
        fn header_size(&self) -> usize {
            0
        }
        fn alignment(&self) -> usize {
            self.alignment
        }
        fn skip(&self, obj: usize) -> usize {
            obj + self.alignment
        }
        fn scan(&self, _ss: &mut ScanState, _base: usize, _limit: usize) -> PoolResult<()> {
            Ok(())
        }
        fn pad(&self, _addr: usize, _size: usize) {}
    }

    #[test]
    fn formatted_objects_walk_visits_live_ams_objects() {
        let mut pool = Pool::new_ams(16, AmsConfig { supports_ambiguous: true });
        let mut buf = Buffer::new(RankSet::single(Rank::Exact));
        pool.buffer_fill(&mut buf, 64).unwrap();
        let format = NopFormat { alignment: 16 };
        let shield = NullShield;
        buf.reserve(64).unwrap();
        buf.commit().unwrap();
        pool.buffer_empty(&mut buf, &format, &shield).unwrap();

        let format = NopFormat { alignment: 16 };
        let shield = NullShield;
        let mut count = 0;
        formatted_objects_walk(&pool, &format, &shield, |_seg, _addr| count += 1);
        assert_eq!(count, 4);
    }

    struct FixedRoots;
    impl RootWalk for FixedRoots {
        fn scan_roots(&self, ss: &mut ScanState) -> PoolResult<()> {
            let mut r = 0usize;
            ss.fix(&mut r)
        }
    }

    #[test]
    fn root_walk_calls_through_to_scanner() {
        let mut fixer = |_r: &mut usize, _rank: Rank, _wm: &mut bool| Ok(());
        let mut ss = ScanState::new(TraceSet::EMPTY, Rank::Exact, &mut fixer);
        root_walk(&FixedRoots, &mut ss).unwrap();
    }
}
