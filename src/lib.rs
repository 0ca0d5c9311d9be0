//! Collectable pool machinery for a tracing garbage collector.
//!
//! This crate implements the arena-facing half of a Memory Pool
//! System-style collector: segments, allocation buffers, and three pool
//! classes (AMS mark-sweep, AWL weak-linked, SNC stack-no-check) built on
//! shared grain/bit-table primitives. The arena, trace scheduler, roots,
//! and object format are out of scope — they're the collaborators behind
//! the [`format::Format`], [`shield::Shield`], and [`trace::TraceContext`]
//! traits.

pub mod ams;
pub mod awl;
pub mod bit_table;
pub mod buffer;
pub mod error;
pub mod format;
pub mod pool;
pub mod pool_gen;
pub mod rank;
pub mod segment;
pub mod shield;
pub mod snc;
pub mod trace;
pub mod walk;

pub use ams::{AmsConfig, AmsPool, AmsSeg};
pub use awl::{AwlLimits, AwlPool, AwlSeg, AwlStats, DependentMap};
pub use bit_table::BitTable;
pub use buffer::Buffer;
pub use error::{PoolError, PoolResult};
pub use format::Format;
pub use pool::Pool;
pub use pool_gen::PoolGen;
pub use rank::{Rank, RankSet, TraceId, TraceSet};
pub use segment::{GrainLayout, SegCore, Summary};
pub use shield::{NullShield, SegId, Shield};
pub use snc::{SncPool, SncSeg};
pub use trace::{ScanState, TraceContext};
pub use walk::{formatted_objects_walk, root_walk, RootWalk};
