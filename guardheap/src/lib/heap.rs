use std::io::{self, Write};

use log::{debug, trace};

use crate::backend::RawAlloc;
use crate::block::{RawBlock, FRESH_FILL};
use crate::policy::{ExceptionPolicy, Handler, PolicyState, Verdict};
use crate::registry::{Block, BlockId, Registry};
use crate::report::{Event, Leak, LogReporter, Reporter, TermReport};
use crate::utils::{ptr, HeapError, NonNull, Origin, Result, Stats};

/// What the exception policy prints to stdout before stopping the process.
pub const OOM_MESSAGE: &str = "Fatal error: out of memory";

/// Invoked once per leaked block at termination, e.g. to wait for a key
/// press before the next one scrolls by.
pub type PauseHook = Box<dyn FnMut(&Leak) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Fill payloads returned by [`Heap::allocate`] with [`FRESH_FILL`].
    pub fill_fresh:     bool,
    /// Stomp header and payload before handing storage back.
    pub stomp_freed:    bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            fill_fresh:     true,
            stomp_freed:    true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
}

/// A tracked heap on top of some [`RawAlloc`].
///
/// Nothing in here is synchronized: a `Heap` may move between threads but
/// must be put behind a lock to be shared.
pub struct Heap<A: RawAlloc> {
    backend:    A,
    registry:   Registry,
    stats:      Stats,
    policy:     ExceptionPolicy,
    lifecycle:  Lifecycle,
    config:     HeapConfig,
    reporter:   Box<dyn Reporter + Send>,
    pause:      Option<PauseHook>,
    // Blocks forgotten by a re-initialization. Their storage is kept alive
    // (callers may still hold the pointers) until the heap goes away.
    orphans:    Vec<Block>,
}

// SAFETY: the only thing keeping `Heap` from being `Send` automatically are
// the raw pointers inside the registry. They point to storage that the heap
// owns exclusively, so moving the heap moves that ownership along.
unsafe impl<A: RawAlloc + Send> Send for Heap<A> {}

impl<A: RawAlloc> Heap<A> {
    pub fn new(backend: A) -> Self {
        Self {
            backend,
            registry:   Registry::new(),
            stats:      Stats::default(),
            policy:     ExceptionPolicy::default(),
            lifecycle:  Lifecycle::Uninitialized,
            config:     HeapConfig::default(),
            reporter:   Box::new(LogReporter),
            pause:      None,
            orphans:    vec![],
        }
    }

    pub fn with_config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + Send + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_pause(mut self, pause: impl FnMut(&Leak) + Send + 'static) -> Self {
        self.pause = Some(Box::new(pause));
        self
    }

    pub fn backend(&self) -> &A {
        &self.backend
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle == Lifecycle::Initialized
    }

    /// Live blocks, most recent first.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.registry.iter().map(|(_, b)| b)
    }

    //-----LIFECYCLE (START)---------------------

    /// Resets the counters and forgets every registered block. Does
    /// nothing if the heap is initialized already.
    pub fn initialize(&mut self) {
        if self.is_initialized() {
            return;
        }
        self.stats = Stats::default();
        let forgotten = self.registry.drain();
        if !forgotten.is_empty() {
            debug!("initialize: forgetting {} stale blocks", forgotten.len());
        }
        self.orphans.extend(forgotten);
        self.lifecycle = Lifecycle::Initialized;
        debug!("heap initialized");
    }

    /// Reports every block that is still live, then the peak. The blocks
    /// themselves stay registered (and valid) until the next
    /// [`Heap::initialize`].
    ///
    /// Whether leaks are fatal is up to the caller; see
    /// [`TermReport::is_clean`].
    pub fn terminate(&mut self) -> TermReport {
        if !self.is_initialized() {
            return TermReport {
                leaks: vec![],
                stats: self.stats,
            };
        }
        let leaks: Vec<Leak> = self.blocks().map(Block::leak).collect();
        for leak in &leaks {
            self.reporter.report(&Event::Leak(leak.clone()));
            if let Some(pause) = self.pause.as_mut() {
                pause(leak);
            }
        }
        self.reporter.report(&Event::Peak {
            bytes: self.stats.bytes_peak,
        });
        self.lifecycle = Lifecycle::Uninitialized;
        debug!("heap terminated with {} live blocks", leaks.len());

        TermReport {
            leaks,
            stats: self.stats,
        }
    }

    //-----LIFECYCLE (END)---------------------

    pub fn policy_state(&self) -> PolicyState {
        self.policy.state()
    }

    /// Picks what happens when the backend runs dry. `handler` is required
    /// for [`PolicyState::CallHandler`] and ignored otherwise.
    pub fn set_exception_policy(&mut self, state: PolicyState, handler: Option<Handler>) -> Result<()> {
        self.policy = ExceptionPolicy::new(state, handler)?;
        Ok(())
    }

    //-----ALLOCATION SURFACE (START)---------------------

    /// Returns `size` bytes filled with [`FRESH_FILL`].
    pub fn allocate(&mut self, size: usize, origin: Origin) -> Result<NonNull<u8>> {
        let block = self.acquire(size, origin)?;
        if self.config.fill_fresh {
            block.raw.fill(FRESH_FILL);
        }

        Ok(self.admit(block))
    }

    /// Returns `size` zeroed bytes.
    pub fn allocate_zeroed(&mut self, size: usize, origin: Origin) -> Result<NonNull<u8>> {
        // Backends hand out zeroed storage already.
        let block = self.acquire(size, origin)?;
        Ok(self.admit(block))
    }

    /// Always moves: the result is a brand-new block holding the first
    /// `min(old, size)` bytes, and the old block is freed. Reallocating to
    /// zero frees and returns `None`; reallocating null allocates.
    pub fn reallocate(&mut self, ptr: *mut u8, size: usize, origin: Origin) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            self.free(ptr, origin)?;
            return Ok(None);
        }
        if ptr.is_null() {
            return self.allocate(size, origin).map(Some);
        }

        let old = self.tracked(ptr as usize, &origin)?;
        self.check_block(old)?;
        let fresh = self.allocate(size, origin.clone())?;
        if let Some(block) = self.registry.get(old) {
            let keep = block.size().min(size);
            // SAFETY: both payloads are live, distinct blocks at least `keep`
            // bytes long.
            unsafe { ptr::copy_nonoverlapping(block.payload().as_ptr(), fresh.as_ptr(), keep) };
        }
        self.free(ptr, origin)?;

        Ok(Some(fresh))
    }

    /// Null is a no-op. Guards are checked before anything else: a corrupted
    /// block is reported and stays registered.
    pub fn free(&mut self, ptr: *mut u8, origin: Origin) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let addr = ptr as usize;
        let id = self.tracked(addr, &origin)?;
        self.check_block(id)?;
        let Some(block) = self.registry.unregister(id) else {
            return Err(self.bad_free(addr, origin));
        };
        self.stats.retire(block.size());
        trace!("free {} bytes at x{addr:x} from {origin}", block.size());
        self.release(block);

        Ok(())
    }

    /// Allocates `bytes.len() + 1` bytes holding `bytes` and a trailing NUL.
    pub fn duplicate_string(&mut self, bytes: Option<&[u8]>, origin: Origin) -> Result<Option<NonNull<u8>>> {
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let p = self.allocate(bytes.len() + 1, origin)?;
        // SAFETY: fresh allocation of `len + 1` bytes.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), p.as_ptr(), bytes.len());
            p.as_ptr().add(bytes.len()).write(0);
        }

        Ok(Some(p))
    }

    //-----ALLOCATION SURFACE (END)---------------------

    //-----VALIDATION (START)---------------------

    /// Checks that `ptr` points into a live block and that the block's
    /// sentinels are intact.
    pub fn validate(&mut self, ptr: *const u8) -> Result<()> {
        let addr = ptr as usize;
        let Some(id) = self.registry.find_containing(addr) else {
            self.reporter.report(&Event::InvalidPointer { ptr: addr });
            return Err(HeapError::InvalidPointer { ptr: addr });
        };

        self.check_block(id)
    }

    /// Validates every live block, most recent first, stopping at the
    /// first violation.
    pub fn check_all(&mut self) -> Result<()> {
        let culprit = self
            .registry
            .iter()
            .find(|(_, b)| b.raw.check().is_err())
            .map(|(id, _)| id);
        match culprit {
            Some(id)    => self.check_block(id),
            None        => Ok(()),
        }
    }

    /// Payload size of the block starting at `ptr`.
    pub fn size_of(&self, ptr: *const u8) -> Option<usize> {
        let id = self.registry.find(ptr as usize)?;
        self.registry.get(id).map(Block::size)
    }

    /// Records a new call site for the block starting at `ptr`.
    pub fn retag_origin(&mut self, ptr: *const u8, origin: Origin) -> Result<()> {
        let addr = ptr as usize;
        let block = self
            .registry
            .find(addr)
            .and_then(|id| self.registry.get_mut(id));
        match block {
            Some(block) => {
                block.set_origin(origin);
                Ok(())
            },
            None        => {
                self.reporter.report(&Event::InvalidPointer { ptr: addr });
                Err(HeapError::InvalidPointer { ptr: addr })
            },
        }
    }

    //-----VALIDATION (END)---------------------

    fn check_block(&mut self, id: BlockId) -> Result<()> {
        let Some(block) = self.registry.get(id) else {
            return Ok(());
        };
        let Err(kind) = block.raw.check() else {
            return Ok(());
        };
        let (ptr, size, origin) = (block.raw.address(), block.size(), block.origin().clone());
        self.reporter.report(&Event::Corrupted {
            kind,
            ptr,
            size,
            origin: origin.clone(),
        });

        Err(HeapError::Corruption { kind, ptr, size, origin })
    }

    fn tracked(&mut self, addr: usize, origin: &Origin) -> Result<BlockId> {
        match self.registry.find(addr) {
            Some(id)    => Ok(id),
            None        => Err(self.bad_free(addr, origin.clone())),
        }
    }

    fn bad_free(&mut self, ptr: usize, origin: Origin) -> HeapError {
        self.reporter.report(&Event::BadFree {
            ptr,
            origin: origin.clone(),
        });
        HeapError::DoubleFreeOrUnregistered { ptr, origin }
    }

    /// Gets storage for a `size`-byte payload from the backend, escalating
    /// to the exception policy for as long as the backend refuses.
    fn acquire(&mut self, size: usize, origin: Origin) -> Result<Block> {
        let footprint = RawBlock::footprint(size);
        loop {
            if let Some(base) = footprint.and_then(|len| self.backend.alloc_zeroed(len)) {
                // SAFETY: fresh backend storage of `footprint` bytes.
                let raw = unsafe { RawBlock::format(base, size) };
                return Ok(Block::new(raw, origin));
            }
            match self.policy.escalate()? {
                Verdict::Retry              => {
                    trace!("retrying alloc of {size} bytes from {origin}");
                },
                Verdict::ReturnNull         => {
                    self.reporter.report(&Event::OutOfMemory {
                        size,
                        origin: origin.clone(),
                    });
                    return Err(HeapError::OutOfMemory { size, origin });
                },
                Verdict::Abort { announce } => self.abort(announce),
            }
        }
    }

    fn abort(&mut self, announce: bool) -> ! {
        if announce {
            let mut out = io::stdout();
            let _ = writeln!(out, "{OOM_MESSAGE}").and_then(|_| out.flush());
        }
        std::process::exit(libc::EXIT_FAILURE)
    }

    fn admit(&mut self, block: Block) -> NonNull<u8> {
        let payload = block.payload();
        let size = block.size();
        trace!("alloc {size} bytes at {payload:p} from {}", block.origin());
        self.registry.register(block);
        self.stats.admit(size);

        payload
    }

    fn release(&mut self, block: Block) {
        let raw = block.into_raw();
        let (base, len) = if self.config.stomp_freed {
            raw.stomp()
        } else {
            raw.into_parts()
        };
        // SAFETY: the block came out of the registry, so its storage was
        // handed out by this backend with exactly this length.
        unsafe { self.backend.release(base, len) };
    }
}

impl<A: RawAlloc> Drop for Heap<A> {
    fn drop(&mut self) {
        let mut blocks = self.registry.drain();
        blocks.append(&mut self.orphans);
        for block in blocks {
            let (base, len) = block.into_raw().into_parts();
            unsafe { self.backend.release(base, len) };
        }
    }
}
