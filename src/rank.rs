//! Reference ranks and small bitsets over ranks/traces.
//!
//! A plain bit-constant newtype, matching the teacher's preference for
//! small hand-rolled enums/bitsets (`CardState`, `GcPhase`) over pulling in
//! a `bitflags` dependency it never uses.

/// The strength class of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// Possibly not a reference at all; conservative scanning.
    Ambig,
    /// A real, precisely-typed strong reference.
    Exact,
    /// Like `Exact`, but the referent must be finalised rather than
    /// reclaimed outright (not used by the pool classes in scope; carried
    /// for interface completeness with the format's rank vocabulary).
    Final,
    /// A weak reference: splatted to null if the referent is unreached.
    Weak,
}

impl Rank {
    const fn bit(self) -> u32 {
        match self {
            Rank::Ambig => 1 << 0,
            Rank::Exact => 1 << 1,
            Rank::Final => 1 << 2,
            Rank::Weak => 1 << 3,
        }
    }
}

/// A set of ranks, e.g. the ranks a segment may be referenced at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct RankSet(u32);

impl RankSet {
    pub const EMPTY: RankSet = RankSet(0);

    pub fn single(rank: Rank) -> RankSet {
        RankSet(rank.bit())
    }

    pub fn is_member(self, rank: Rank) -> bool {
        self.0 & rank.bit() != 0
    }

    pub fn add(self, rank: Rank) -> RankSet {
        RankSet(self.0 | rank.bit())
    }

    pub fn union(self, other: RankSet) -> RankSet {
        RankSet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True iff this set contains exactly the one given rank.
    pub fn is_single(self, rank: Rank) -> bool {
        self.0 == rank.bit()
    }
}

/// Identifier for one collection cycle (trace), assigned by the external
/// trace controller. Opaque to the pool machinery beyond equality/bit
/// membership in a `TraceSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u8);

/// A small bitset of trace ids, used for `SegWhite`/`SegGrey`/`ss.traces`.
/// Up to 32 concurrently-live traces, which is far beyond what a
/// single-threaded cooperative collector (spec §5) ever has in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TraceSet(u32);

impl TraceSet {
    pub const EMPTY: TraceSet = TraceSet(0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_member(self, id: TraceId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    pub fn add(self, id: TraceId) -> TraceSet {
        TraceSet(self.0 | (1 << id.0))
    }

    pub fn del(self, id: TraceId) -> TraceSet {
        TraceSet(self.0 & !(1 << id.0))
    }

    pub fn union(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 | other.0)
    }

    pub fn inter(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & other.0)
    }

    pub fn diff(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & !other.0)
    }

    /// True iff this set has exactly one member.
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_set_membership() {
        let rs = RankSet::single(Rank::Weak);
        assert!(rs.is_member(Rank::Weak));
        assert!(!rs.is_member(Rank::Exact));
        assert!(rs.is_single(Rank::Weak));
    }

    #[test]
    fn trace_set_ops() {
        let t0 = TraceId(0);
        let t1 = TraceId(1);
        let s = TraceSet::EMPTY.add(t0);
        assert!(s.is_member(t0) && !s.is_member(t1));
        assert!(s.is_single());
        let s2 = s.add(t1);
        assert_eq!(s2.len(), 2);
        assert!(!s2.is_single());
        assert_eq!(s2.diff(s), TraceSet::EMPTY.add(t1));
        assert_eq!(s2.del(t1), s);
    }
}
