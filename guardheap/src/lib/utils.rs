pub use std::{
    borrow::Cow,
    fmt,
    panic::Location,
    ptr::{self, NonNull},
};
pub use thiserror::Error;

/// Where an allocation was requested from. The classic way to get this is a
/// `__FILE__`/`__LINE__` pair smuggled in by a macro; in Rust,
/// [`Origin::caller`] asks the compiler for the call site instead.
///
/// Reallocation and [`crate::Heap::retag_origin`] may change the origin of a
/// live block without touching its data.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Origin {
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl Origin {
    pub fn new(file: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// The source location where `Origin::caller()` is written. Inside a
    /// `#[track_caller]` function it is that function's caller instead,
    /// and so on up the chain of `#[track_caller]` functions.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = Location::caller();
        Self {
            file: Cow::Borrowed(loc.file()),
            line: loc.line(),
        }
    }

    /// Origin of the registry's head node, which is never a user allocation.
    pub const fn noname() -> Self {
        Self {
            file: Cow::Borrowed("noname"),
            line: 11111,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file '{}' line {}", self.file, self.line)
    }
}

/// Which of the two sentinels around a payload was found trampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Corruption {
    /// Something wrote before the start of the payload.
    Underrun,
    /// Something wrote past `size` bytes into the payload.
    Overrun,
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::Underrun    => write!(f, "underrun"),
            Corruption::Overrun     => write!(f, "overrun"),
        }
    }
}

/// Process-wide (well, heap-wide) bookkeeping.
///
/// `bytes_peak` never decreases and is always `>= bytes_live`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub live_count: usize,
    pub bytes_live: usize,
    pub bytes_peak: usize,
}

impl Stats {
    pub(crate) fn admit(&mut self, size: usize) {
        self.live_count += 1;
        self.bytes_live += size;
        if self.bytes_live > self.bytes_peak {
            self.bytes_peak = self.bytes_live;
        }
    }

    pub(crate) fn retire(&mut self, size: usize) {
        self.live_count -= 1;
        self.bytes_live -= size;
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The backend is exhausted and the exception policy decided to let the
    /// caller know.
    #[error("out of memory: {size} bytes requested from {origin}")]
    OutOfMemory { size: usize, origin: Origin },

    #[error("pointer x{ptr:x} {kind}, alloc'd from {origin} nbytes {size}")]
    Corruption {
        kind:   Corruption,
        ptr:    usize,
        size:   usize,
        origin: Origin,
    },

    /// `free` (or `reallocate`) on something that is not currently a live
    /// block. Most of the time this is a double free.
    #[error("pointer x{ptr:x} is not a live allocation, free'd from {origin}")]
    DoubleFreeOrUnregistered { ptr: usize, origin: Origin },

    #[error("pointer x{ptr:x} does not point into any live allocation")]
    InvalidPointer { ptr: usize },

    #[error("configuration error: {0}")]
    Configuration(&'static str),
}

pub type Result<T> = std::result::Result<T, HeapError>;
