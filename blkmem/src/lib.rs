//! Block memory allocator for many small, short lived objects
//!
//! Four layers build on each other:
//!
//! * [StandardMemory] wraps the system allocator, rejects oversized requests
//!   and (with debug assertions) records every live block in a process wide
//!   shadow list so leaks and double frees can be reported.
//! * [ChunkMemory] is a pool of equally sized elements carved out of
//!   progressively larger chunks, with a lazy and an eager free list and
//!   adaptive garbage collection of empty chunks.
//! * [BlockMemory] keeps one [ChunkMemory] per aligned element size.
//! * [BufferMemory] is a LIFO stack of reusable scratch buffers.
//!
//! Every object reports problems through a [DiagnosticSink] (by default
//! [TracingSink]) and returns them as a [MemError]. Public operations are
//! `#[track_caller]` so diagnostics and leak reports point at user code.

mod util;

pub mod block;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod diag;
pub mod error;
pub mod standard;

pub use block::{BlockLeakReport, BlockMemory, SizeClassLeak};
pub use buffer::BufferMemory;
pub use chunk::{search_ranges, ChunkInfo, ChunkMemory, ChunkMemoryStats};
pub use config::{BlockMemoryConfig, BufferMemoryConfig, ChunkMemoryConfig};
pub use diag::{
    CollectingSink, Diagnostic, DiagnosticSink, Diagnostics, Severity, Site, TracingSink,
};
pub use error::MemError;
pub use standard::{LeakEntry, LeakReport, StandardMemory};
pub use util::{calc_grow_size, UsizePtr};
