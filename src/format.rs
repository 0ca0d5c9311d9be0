//! The client-supplied object format: the one interface the pool core
//! consumes from the out-of-scope collaborators (spec.md §1, §6).

use crate::error::PoolResult;
use crate::trace::ScanState;

/// Object layout contract supplied by the mutator's language runtime.
/// Addresses are byte offsets into a segment's backing storage.
pub trait Format {
    /// Size in bytes of the per-object header the pool core skips when
    /// computing the client-visible reference from an object's base.
    fn header_size(&self) -> usize;

    /// Required alignment of every object base address; also defines the
    /// grain size for pools using this format.
    fn alignment(&self) -> usize;

    /// Given the address of an object (past its header), return the
    /// address immediately following the object (i.e. the next object's
    /// header-relative base, or the header-inclusive base depending on
    /// caller convention — pool classes call this consistently with
    /// `poolams.c`'s `format->skip`, which takes and returns
    /// header-relative addresses).
    fn skip(&self, obj: usize) -> usize;

    /// Scan the references in `[base, limit)`, calling back into `ss` for
    /// each one found (the scan state owns the per-reference fix dispatch).
    fn scan(&self, ss: &mut ScanState, base: usize, limit: usize) -> PoolResult<()>;

    /// Overwrite `[addr, addr+size)` with a single padding object, used
    /// when a pool releases a region without an object occupying it
    /// (SNC's freelist segments, a buffer's unused tail).
    fn pad(&self, addr: usize, size: usize);
}
