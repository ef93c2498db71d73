//! A guarded block looks like this in memory:
//!
//! ```text
//! base
//! +------------------+
//! | nbytes     (u64) |
//! | reserved   (u32) |
//! | before     (u32) |  0x12345678
//! +------------------+  <- payload, 16 bytes past base
//! | payload          |  nbytes bytes
//! +------------------+
//! | after      (u32) |  0x87654321, not necessarily aligned
//! +------------------+
//! ```
//!
//! The sentinels have to live in the same storage as the payload, since
//! the whole point is to notice stray writes right outside of it.
use std::mem::{offset_of, size_of};

use crate::utils::{Corruption, NonNull};

/// Detects writes right before the payload.
pub const BEFORE_VAL: u32 = 0x1234_5678;
/// Detects writes right after the payload.
pub const AFTER_VAL: u32 = 0x8765_4321;
/// Freshly allocated (non-zeroed) payloads are filled with this, so that
/// reads before initialization stand out.
pub const FRESH_FILL: u8 = 0xEE;
/// Header and payload are stomped with this right before the storage goes
/// back to the backend.
pub const FREED_FILL: u8 = 0xFF;

#[repr(C)]
struct Header {
    nbytes:     u64,
    reserved:   u32,
    before:     u32,
}

pub const HEADER_SIZE: usize = size_of::<Header>();
pub const TRAILER_SIZE: usize = size_of::<u32>();
const BEFORE_OFFSET: usize = offset_of!(Header, before);

// `before` must sit right against the payload, and the payload must keep
// the backend's alignment.
const _: () = assert!(BEFORE_OFFSET + size_of::<u32>() == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE == crate::backend::BACKEND_ALIGN);

/// Owning handle to the storage of one guarded allocation. It is neither
/// `Copy` nor `Clone`: whoever holds it is responsible for giving the
/// storage back.
#[derive(Debug, PartialEq, Eq)]
pub struct RawBlock {
    base: NonNull<u8>,
    size: usize,
}

impl RawBlock {
    /// Bytes that must be requested from the backend for a payload of
    /// `size` bytes, or `None` if that overflows.
    pub const fn footprint(size: usize) -> Option<usize> {
        match size.checked_add(HEADER_SIZE) {
            Some(n) => n.checked_add(TRAILER_SIZE),
            None    => None,
        }
    }

    /// Writes the header and both sentinels. The payload is left alone.
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of `RawBlock::footprint(size)` bytes,
    /// aligned to [`crate::backend::BACKEND_ALIGN`], and owned by nobody else.
    pub unsafe fn format(base: NonNull<u8>, size: usize) -> Self {
        let header = Header {
            nbytes:     size as u64,
            reserved:   0,
            before:     BEFORE_VAL,
        };
        unsafe {
            base.cast::<Header>().write(header);
            base.add(HEADER_SIZE + size)
                .cast::<u32>()
                .write_unaligned(AFTER_VAL);
        }

        Self { base, size }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Total length of the backing storage.
    pub fn len(&self) -> usize {
        // Computed once already in `format`'s caller, cannot overflow.
        HEADER_SIZE + self.size + TRAILER_SIZE
    }

    pub fn payload(&self) -> NonNull<u8> {
        // SAFETY: the header is part of the same allocation.
        unsafe { self.base.add(HEADER_SIZE) }
    }

    pub fn address(&self) -> usize {
        self.payload().as_ptr() as usize
    }

    /// `true` if `addr` is the payload start, or anywhere inside the
    /// payload. A zero-sized block only owns its start address.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.address();
        addr == start || (addr > start && addr - start < self.size)
    }

    fn before(&self) -> u32 {
        unsafe {
            self.base
                .add(BEFORE_OFFSET)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    fn after(&self) -> u32 {
        unsafe {
            self.payload()
                .add(self.size)
                .cast::<u32>()
                .read_unaligned()
        }
    }

    /// Compares both sentinels against their expected values. The front
    /// one is looked at first.
    pub fn check(&self) -> Result<(), Corruption> {
        if self.before() != BEFORE_VAL {
            return Err(Corruption::Underrun);
        }
        if self.after() != AFTER_VAL {
            return Err(Corruption::Overrun);
        }

        Ok(())
    }

    /// Fills the payload (and only the payload) with `byte`.
    pub fn fill(&self, byte: u8) {
        unsafe { self.payload().as_ptr().write_bytes(byte, self.size) }
    }

    /// Overwrites header and payload with [`FREED_FILL`] and hands back the
    /// storage, ready to be released.
    pub fn stomp(self) -> (NonNull<u8>, usize) {
        unsafe {
            self.base
                .as_ptr()
                .write_bytes(FREED_FILL, HEADER_SIZE + self.size)
        }
        self.into_parts()
    }

    pub fn into_parts(self) -> (NonNull<u8>, usize) {
        let len = self.len();
        (self.base, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{RawAlloc, SystemAlloc};

    fn with_block(size: usize, f: impl FnOnce(&RawBlock)) {
        let len = RawBlock::footprint(size).unwrap();
        let base = SystemAlloc.alloc_zeroed(len).unwrap();
        let block = unsafe { RawBlock::format(base, size) };
        f(&block);
        let (base, len) = block.into_parts();
        unsafe { SystemAlloc.release(base, len) };
    }

    #[test]
    fn layout_is_sixteen_bytes_of_header() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(TRAILER_SIZE, 4);
        assert_eq!(RawBlock::footprint(10), Some(30));
        assert_eq!(RawBlock::footprint(usize::MAX), None);
    }

    #[test]
    fn fresh_block_passes() {
        with_block(7, |b| {
            assert_eq!(b.check(), Ok(()));
            assert_eq!(b.payload().as_ptr() as usize % 16, 0);
        });
    }

    #[test]
    fn trampled_sentinels_are_told_apart() {
        with_block(5, |b| {
            unsafe { b.payload().as_ptr().sub(1).write(0) };
            assert_eq!(b.check(), Err(Corruption::Underrun));
        });
        with_block(5, |b| {
            unsafe { b.payload().as_ptr().add(5).write(0) };
            assert_eq!(b.check(), Err(Corruption::Overrun));
        });
    }

    #[test]
    fn containment() {
        with_block(4, |b| {
            let start = b.address();
            assert!(b.contains(start));
            assert!(b.contains(start + 3));
            assert!(!b.contains(start + 4));
            assert!(!b.contains(start - 1));
        });
        with_block(0, |b| {
            assert!(b.contains(b.address()));
            assert!(!b.contains(b.address() + 1));
        });
    }
}
