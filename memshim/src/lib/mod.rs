//! The classic `mem_*` debug-allocator API, for C programs.
//!
//! One process-wide [`guardheap::Heap`] over the C library's `calloc`/`free`
//! sits behind a mutex. Corruption, bad frees and bad pointers handed to
//! `mem_checkptr` write their diagnostic and abort, like a failed `assert`.
//! Running out of memory goes through the policy set with
//! `mem_setexception`; the handler runs with the heap unlocked, so it may
//! call `mem_free` to release caches.
//!
//! Environment:
//! - `MEMGUARD_REPORT`: file to write diagnostics to (`stdout` otherwise).
//! - `MEMGUARD_PAUSE`: wait for Enter after each unfreed pointer.
//! - `MEMGUARD_POLICY`: `abortmsg`, `abort`, `retnull` or `retry`.
mod ffi;
mod logic;
mod core;

pub use crate::core::*;
pub use crate::ffi::{CHandler, MEM_ABORT, MEM_ABORTMSG, MEM_CALLFP, MEM_RETNULL, MEM_RETRY};
pub use crate::logic::{parse_policy, with_heap, Settings, ShimHeap};
