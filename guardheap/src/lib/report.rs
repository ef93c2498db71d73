use std::hash::BuildHasherDefault;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use ahash::AHasher;
use indexmap::IndexMap;
use log::{error, info, warn};

use crate::utils::{Corruption, Origin, Stats};

/// One allocation that was still live at termination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leak {
    pub origin: Origin,
    pub size:   usize,
    pub ptr:    usize,
}

/// Everything the heap has to say about itself goes through a
/// [`Reporter`] as one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A sentinel was found trampled.
    Corrupted {
        kind:   Corruption,
        ptr:    usize,
        size:   usize,
        origin: Origin,
    },
    /// `free`/`reallocate` of a pointer that isn't live.
    BadFree { ptr: usize, origin: Origin },
    /// `validate`/`retag_origin` of a pointer that isn't live.
    InvalidPointer { ptr: usize },
    /// Unreleased allocation found at termination.
    Leak(Leak),
    /// Emitted once at termination.
    Peak { bytes: usize },
    /// The exception policy resolved to failing the request.
    OutOfMemory { size: usize, origin: Origin },
}

pub trait Reporter {
    fn report(&mut self, event: &Event);
}

impl<R: Reporter + ?Sized> Reporter for Box<R> {
    fn report(&mut self, event: &Event) {
        (**self).report(event)
    }
}

/// Sends events to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, event: &Event) {
        match event {
            Event::Corrupted { kind, ptr, size, origin } => {
                error!("pointer x{ptr:x} {kind}, alloc'd from {origin} nbytes {size}");
            },
            Event::BadFree { ptr, origin }  => {
                error!("free of untracked pointer x{ptr:x} from {origin}");
            },
            Event::InvalidPointer { ptr }   => {
                error!("pointer x{ptr:x} is not in any live allocation");
            },
            Event::Leak(leak)               => {
                warn!("unfreed pointer x{:x}: alloc'd from {} nbytes {}", leak.ptr, leak.origin, leak.size);
            },
            Event::Peak { bytes }           => {
                info!("max amount ever allocated == {bytes} bytes");
            },
            Event::OutOfMemory { size, origin } => {
                warn!("insufficient memory for alloc of {size} at {origin}");
            },
        }
    }
}

/// Writes the classic one-line-per-event text to anything `Write`.
#[derive(Debug)]
pub struct TextReporter<W: Write> {
    out: W,
}

impl<W: Write> TextReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_event(&mut self, event: &Event) -> io::Result<()> {
        match event {
            Event::Corrupted { kind, ptr, size, origin } => {
                writeln!(self.out, "Pointer x{ptr:x} {kind}")?;
                writeln!(self.out, "alloc'd from {origin} nbytes {size} ptr x{ptr:x}")?;
            },
            Event::BadFree { ptr, origin }  => {
                writeln!(self.out, "Pointer x{ptr:x} is not allocated")?;
                writeln!(self.out, "free'd from File '{}' line {}", origin.file, origin.line)?;
            },
            Event::InvalidPointer { ptr }   => {
                writeln!(self.out, "Pointer x{ptr:x} is not in any allocated block")?;
            },
            Event::Leak(leak)               => {
                writeln!(
                    self.out,
                    "Unfreed pointer: alloc'd from {} nbytes {} ptr x{:x}",
                    leak.origin, leak.size, leak.ptr
                )?;
            },
            Event::Peak { bytes }           => {
                writeln!(self.out, "Max amount ever allocated == {bytes} bytes")?;
            },
            Event::OutOfMemory { size, origin } => {
                writeln!(
                    self.out,
                    "Insufficient memory for alloc of {size} at File '{}' line {}",
                    origin.file, origin.line
                )?;
            },
        }
        self.out.flush()
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn report(&mut self, event: &Event) {
        // The diagnostic channel has nowhere to report its own failures.
        let _ = self.write_event(event);
    }
}

/// Keeps every event in memory. Clones share the same log, so one clone can
/// be handed to a heap and another kept around for inspection.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events)  => events.clone(),
            Err(e)      => e.into_inner().clone(),
        }
    }

    pub fn leaks(&self) -> Vec<Leak> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Leak(leak)   => Some(leak),
                _                   => None,
            })
            .collect()
    }
}

impl Reporter for Recorder {
    fn report(&mut self, event: &Event) {
        match self.events.lock() {
            Ok(mut events)  => events.push(event.clone()),
            Err(e)          => e.into_inner().push(event.clone()),
        }
    }
}

/// Leaks grouped per call site: (number of blocks, total bytes), in the
/// order the call sites were first met.
pub type LeakBook = IndexMap<Origin, (usize, usize), BuildHasherDefault<AHasher>>;

/// What [`crate::Heap::terminate`] found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TermReport {
    /// Most recent allocation first.
    pub leaks: Vec<Leak>,
    pub stats: Stats,
}

impl TermReport {
    /// `true` when every allocation was released.
    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty() && self.stats.live_count == 0 && self.stats.bytes_live == 0
    }

    pub fn peak(&self) -> usize {
        self.stats.bytes_peak
    }

    pub fn by_origin(&self) -> LeakBook {
        let mut book = LeakBook::default();
        for leak in &self.leaks {
            let entry = book.entry(leak.origin.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += leak.size;
        }

        book
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak(file: &'static str, line: u32, size: usize) -> Leak {
        Leak {
            origin: Origin::new(file, line),
            size,
            ptr: 0x1000 + line as usize,
        }
    }

    #[test]
    fn text_format_matches_classic_lines() {
        let mut rep = TextReporter::new(Vec::new());
        rep.report(&Event::Leak(leak("main.c", 12, 40)));
        rep.report(&Event::Peak { bytes: 128 });
        rep.report(&Event::Corrupted {
            kind:   Corruption::Overrun,
            ptr:    0xbeef,
            size:   3,
            origin: Origin::new("x.c", 7),
        });
        let text = String::from_utf8(rep.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Unfreed pointer: alloc'd from file 'main.c' line 12 nbytes 40 ptr x100c");
        assert_eq!(lines[1], "Max amount ever allocated == 128 bytes");
        assert_eq!(lines[2], "Pointer xbeef overrun");
        assert_eq!(lines[3], "alloc'd from file 'x.c' line 7 nbytes 3 ptr xbeef");
    }

    #[test]
    fn recorder_clones_share_the_log() {
        let rec = Recorder::new();
        let mut handed_out = rec.clone();
        handed_out.report(&Event::Leak(leak("a.rs", 1, 1)));
        handed_out.report(&Event::Peak { bytes: 1 });
        assert_eq!(rec.events().len(), 2);
        assert_eq!(rec.leaks(), vec![leak("a.rs", 1, 1)]);
    }

    #[test]
    fn leaks_grouped_by_first_seen_origin() {
        let report = TermReport {
            leaks: vec![leak("b.rs", 2, 10), leak("a.rs", 1, 5), leak("b.rs", 2, 6)],
            stats: Stats { live_count: 3, bytes_live: 21, bytes_peak: 21 },
        };
        assert!(!report.is_clean());
        let book = report.by_origin();
        let keys: Vec<u32> = book.keys().map(|o| o.line).collect();
        assert_eq!(keys, vec![2, 1]);
        assert_eq!(book[&Origin::new("b.rs", 2)], (2, 16));
        assert_eq!(book[&Origin::new("a.rs", 1)], (1, 5));
    }
}
