//! `guardheap` has no allocation strategy of its own. Storage comes from a
//! [`RawAlloc`], which only has to hand out zeroed bytes, take them back,
//! and say `None` when it can't.
use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::utils::NonNull;

/// Alignment every backend must honour. The block header is exactly this
/// long, so payloads inherit it.
pub const BACKEND_ALIGN: usize = 16;

pub trait RawAlloc {
    /// Returns `len` zeroed bytes aligned to [`BACKEND_ALIGN`], or `None`
    /// if the request can't be satisfied right now.
    fn alloc_zeroed(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by [`RawAlloc::alloc_zeroed`] on this
    /// very allocator with the same `len`, and not released since.
    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize);
}

impl<A: RawAlloc + ?Sized> RawAlloc for Box<A> {
    fn alloc_zeroed(&mut self, len: usize) -> Option<NonNull<u8>> {
        (**self).alloc_zeroed(len)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe { (**self).release(ptr, len) }
    }
}

/// The C library's `calloc`/`free`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcAlloc;

impl RawAlloc for LibcAlloc {
    fn alloc_zeroed(&mut self, len: usize) -> Option<NonNull<u8>> {
        // `calloc` is aligned for `max_align_t`, which is 16 on the 64-bit
        // targets we care about.
        let p = unsafe { libc::calloc(len, 1) };
        NonNull::new(p.cast::<u8>())
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, _len: usize) {
        unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) }
    }
}

/// Rust's [`System`] allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAlloc;

impl RawAlloc for SystemAlloc {
    fn alloc_zeroed(&mut self, len: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(len, BACKEND_ALIGN).ok()?;
        NonNull::new(unsafe { System.alloc_zeroed(layout) })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        // Same layout as in `alloc_zeroed`, which already succeeded.
        let layout = unsafe { Layout::from_size_align_unchecked(len, BACKEND_ALIGN) };
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

/// A shared byte allowance. Clones refer to the same counter, which lets
/// an out-of-memory handler "free some caches" by handing bytes back.
#[derive(Clone, Debug, Default)]
pub struct Budget(Arc<AtomicUsize>);

impl Budget {
    pub fn new(bytes: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(bytes)))
    }

    pub fn remaining(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn refill(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::AcqRel);
    }

    fn take(&self, bytes: usize) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(bytes))
            .is_ok()
    }
}

/// Wraps another backend and refuses anything that would exceed a
/// [`Budget`]. Bytes come back to the budget when released.
///
/// Mostly useful for driving the exception policy on purpose.
#[derive(Debug)]
pub struct Capped<A> {
    inner:  A,
    budget: Budget,
}

impl<A: RawAlloc> Capped<A> {
    pub fn new(inner: A, budget: Budget) -> Self {
        Self { inner, budget }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }
}

impl<A: RawAlloc> RawAlloc for Capped<A> {
    fn alloc_zeroed(&mut self, len: usize) -> Option<NonNull<u8>> {
        if !self.budget.take(len) {
            return None;
        }
        let res = self.inner.alloc_zeroed(len);
        if res.is_none() {
            self.budget.refill(len);
        }
        res
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, len: usize) {
        unsafe { self.inner.release(ptr, len) };
        self.budget.refill(len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capped_refuses_past_budget() {
        let budget = Budget::new(64);
        let mut alloc = Capped::new(SystemAlloc, budget.clone());

        let a = alloc.alloc_zeroed(48).unwrap();
        assert_eq!(budget.remaining(), 16);
        assert!(alloc.alloc_zeroed(32).is_none());
        assert_eq!(budget.remaining(), 16);

        unsafe { alloc.release(a, 48) };
        assert_eq!(budget.remaining(), 64);
        let b = alloc.alloc_zeroed(32).unwrap();
        unsafe { alloc.release(b, 32) };
    }

    #[test]
    fn backends_hand_out_zeroed_aligned_bytes() {
        let backends: [&mut dyn RawAlloc; 2] = [&mut LibcAlloc, &mut SystemAlloc];
        for backend in backends {
            let p = backend.alloc_zeroed(100).unwrap();
            assert_eq!(p.as_ptr() as usize % 8, 0);
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), 100) };
            assert!(bytes.iter().all(|b| *b == 0));
            unsafe { backend.release(p, 100) };
        }
    }
}
