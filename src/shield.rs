//! Memory-protection driver boundary (spec.md §1 "shield").
//!
//! Out of scope: the pool core only ever brackets mutator-visible reads
//! with `expose`/`cover`; it never implements page protection itself.

/// Opaque segment identifier used across the shield/format/trace
/// collaborator boundary, independent of how segments are stored
/// internally by a pool.
pub type SegId = usize;

/// Exposes/covers a segment's memory so the collector may read it without
/// retriggering its own read barrier.
pub trait Shield {
    /// Lift page protection on `seg` for the duration of the bracket;
    /// must be paired with a following `cover` before any other actor
    /// (real or simulated) accesses `seg` through the barrier.
    fn expose(&self, seg: SegId);

    /// Restore page protection on `seg` after an `expose`.
    fn cover(&self, seg: SegId);
}

/// A shield that does nothing, for single-threaded tests and for pool
/// configurations that run without real memory protection (e.g. embedding
/// in a language runtime that polices its own barriers).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullShield;

impl Shield for NullShield {
    fn expose(&self, _seg: SegId) {}
    fn cover(&self, _seg: SegId) {}
}
