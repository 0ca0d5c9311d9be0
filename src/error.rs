//! Error taxonomy for the pool machinery.
//!
//! Mirrors the kinds a pool class implementation can surface: resource
//! exhaustion, caller contract violations, and the "didn't apply, not an
//! error" signal used by the single-access optimisation and emergency fix.

use thiserror::Error;

/// Error kinds a pool operation can report.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Out of virtual address space or committed memory.
    #[error("out of memory: {0}")]
    Memory(String),

    /// A bounded resource (trace slot, zone, table) was exhausted.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Contract violation by the caller.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// The operation did not apply but this is not an error; caller falls
    /// back to a more general path (e.g. single-access -> segment scan).
    #[error("operation did not apply")]
    Fail,

    /// Assertion target: indicates a programming error, not a runtime
    /// condition a caller can recover from.
    #[error("unimplemented: {0}")]
    Unimpl(&'static str),
}

/// Result alias used throughout the pool machinery.
pub type PoolResult<T> = Result<T, PoolError>;
