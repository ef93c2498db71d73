//! Welcome to `guardheap`!
//!
//! Every request that goes through a [`Heap`] is forwarded to some raw
//! allocator (see [`backend`]) and the returned storage is wrapped with a
//! small header and a trailing sentinel:
//!
//! ```text
//! +--------+--------+----------------------+-------+
//! | nbytes | before |  payload (nbytes)    | after |
//! +--------+--------+----------------------+-------+
//!                   ^ pointer handed out
//! ```
//!
//! Each live block is catalogued in a [`registry::Registry`]. That is how
//! underruns, overruns, double frees and leaks get caught deterministically
//! instead of silently corrupting the heap.
//!
//! ```
//! use guardheap::{backend::SystemAlloc, Heap, Origin};
//!
//! let mut heap = Heap::new(SystemAlloc);
//! heap.initialize();
//! let p = heap.allocate(16, Origin::caller()).unwrap();
//! heap.validate(p.as_ptr()).unwrap();
//! heap.free(p.as_ptr(), Origin::caller()).unwrap();
//! assert!(heap.terminate().is_clean());
//! ```

/// Types, errors and re-exports needed almost everywhere.
mod utils;

/// The raw allocators that actually hand out storage.
pub mod backend;

/// Physical layout of a guarded allocation.
pub mod block;

/// The catalogue of live blocks.
pub mod registry;

/// What to do when the backend runs dry.
pub mod policy;

/// The diagnostic channel.
pub mod report;

mod heap;

pub use crate::utils::{Corruption, HeapError, Origin, Result, Stats};
pub use crate::heap::{Heap, HeapConfig, Lifecycle, PauseHook};
pub use crate::policy::{ExceptionPolicy, Handler, PolicyState, Verdict};
pub use crate::report::{Event, Leak, LogReporter, Recorder, Reporter, TermReport, TextReporter};
