//! Scripted heap misuse. Each [`Scenario`] makes one classic mistake on a
//! fresh [`Heap`], and [`verify`] checks that the mistake was caught as
//! the right kind of [`HeapError`].
use std::io::Write;

use anyhow::{bail, ensure, Result};
use clap::ValueEnum;
use guardheap::backend::{Budget, Capped, SystemAlloc};
use guardheap::{Corruption, Handler, Heap, HeapError, Origin, PolicyState, TermReport, TextReporter};
use log::{debug, info};

pub type CheckHeap = Heap<Capped<SystemAlloc>>;

/// Backend allowance for [`Scenario::Oom`].
pub const OOM_BUDGET: usize = 256;
/// What [`Scenario::Oom`] asks for: more than [`OOM_BUDGET`].
pub const OOM_REQUEST: usize = 1024;
/// What [`Policy::Handler`] gives back to the backend each time it runs.
pub const OOM_REFILL: usize = 2 * OOM_REQUEST;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Everything allocated is freed
    Clean,
    /// One block is never freed
    Leak,
    /// One byte written past the end of a block
    Overrun,
    /// One byte written before the start of a block
    Underrun,
    /// The same block freed twice
    DoubleFree,
    /// A stack address checked as if it were heap
    Stray,
    /// A block grown by reallocation keeps its contents
    Realloc,
    /// A request bigger than the backend can satisfy
    Oom,
}

impl Scenario {
    pub fn all() -> &'static [Scenario] {
        Scenario::value_variants()
    }
}

/// Out-of-memory behavior, as far as a scenario is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Policy {
    /// Print "Fatal error: out of memory" and exit
    Abortmsg,
    /// Exit without a word
    Abort,
    /// Report the failure to the caller
    Retnull,
    /// Hand the backend more budget, then retry
    Handler,
}

impl Policy {
    fn resolve(self, budget: &Budget) -> (PolicyState, Option<Handler>) {
        match self {
            Policy::Abortmsg    => (PolicyState::AbortWithMessage, None),
            Policy::Abort       => (PolicyState::AbortSilently, None),
            Policy::Retnull     => (PolicyState::ReturnNull, None),
            Policy::Handler     => {
                let budget = budget.clone();
                let handler: Handler = Box::new(move || {
                    debug!("handler: refilling the budget by {OOM_REFILL} bytes");
                    budget.refill(OOM_REFILL);
                    PolicyState::Retry
                });
                (PolicyState::CallHandler, Some(handler))
            },
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    /// The error the scenario's mistake produced, if any.
    pub caught: Option<HeapError>,
    pub report: TermReport,
}

/// Runs `scenario` on a fresh heap whose diagnostics go to `out`.
pub fn run<W>(scenario: Scenario, policy: Policy, out: W) -> Result<Outcome>
where
    W: Write + Send + 'static,
{
    let budget = Budget::new(match scenario {
        Scenario::Oom   => OOM_BUDGET,
        _               => usize::MAX,
    });
    let mut heap = Heap::new(Capped::new(SystemAlloc, budget.clone()))
        .with_reporter(TextReporter::new(out));
    heap.initialize();
    let (state, handler) = policy.resolve(&budget);
    heap.set_exception_policy(state, handler)?;
    info!("running {scenario:?} with {policy:?}");

    let caught = match scenario {
        Scenario::Clean         => clean(&mut heap)?,
        Scenario::Leak          => leak(&mut heap)?,
        Scenario::Overrun       => overrun(&mut heap)?,
        Scenario::Underrun      => underrun(&mut heap)?,
        Scenario::DoubleFree    => double_free(&mut heap)?,
        Scenario::Stray         => stray(&mut heap)?,
        Scenario::Realloc       => realloc(&mut heap)?,
        Scenario::Oom           => oom(&mut heap)?,
    };
    let report = heap.terminate();

    Ok(Outcome { caught, report })
}

/// Did `scenario` end the way it should have?
pub fn verify(scenario: Scenario, policy: Policy, outcome: &Outcome) -> Result<()> {
    let caught = &outcome.caught;
    match scenario {
        Scenario::Clean | Scenario::Realloc => {
            ensure!(caught.is_none(), "unexpected error: {caught:?}");
            ensure!(outcome.report.is_clean(), "leaks left: {:?}", outcome.report.leaks);
        },
        Scenario::Leak          => {
            ensure!(caught.is_none(), "unexpected error: {caught:?}");
            ensure!(outcome.report.leaks.len() == 1, "expected one leak, got {:?}", outcome.report.leaks);
        },
        Scenario::Overrun       => {
            ensure!(
                matches!(caught, Some(HeapError::Corruption { kind: Corruption::Overrun, .. })),
                "overrun went unnoticed: {caught:?}"
            );
        },
        Scenario::Underrun      => {
            ensure!(
                matches!(caught, Some(HeapError::Corruption { kind: Corruption::Underrun, .. })),
                "underrun went unnoticed: {caught:?}"
            );
        },
        Scenario::DoubleFree    => {
            ensure!(
                matches!(caught, Some(HeapError::DoubleFreeOrUnregistered { .. })),
                "double free went unnoticed: {caught:?}"
            );
        },
        Scenario::Stray         => {
            ensure!(
                matches!(caught, Some(HeapError::InvalidPointer { .. })),
                "stray pointer went unnoticed: {caught:?}"
            );
        },
        Scenario::Oom           => match policy {
            Policy::Retnull     => {
                ensure!(
                    matches!(caught, Some(HeapError::OutOfMemory { size: OOM_REQUEST, .. })),
                    "allocation should have failed: {caught:?}"
                );
            },
            Policy::Handler     => {
                ensure!(caught.is_none(), "handler should have rescued the allocation: {caught:?}");
                ensure!(outcome.report.is_clean(), "leaks left: {:?}", outcome.report.leaks);
            },
            // Never gets here: the process is gone.
            Policy::Abortmsg | Policy::Abort => bail!("{policy:?} returned from an exhausted heap"),
        },
    }

    Ok(())
}

//-----SCENARIOS (START)---------------------

fn clean(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let mut live = vec![];
    for size in [1, 16, 100, 4096] {
        let p = heap.allocate(size, Origin::caller())?;
        unsafe { p.as_ptr().write_bytes(0x5a, size) };
        live.push(p);
    }
    heap.check_all()?;
    for p in live.into_iter().rev() {
        heap.free(p.as_ptr(), Origin::caller())?;
    }

    Ok(None)
}

fn leak(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let _forgotten = heap.allocate(24, Origin::caller())?;
    let freed = heap.allocate(8, Origin::caller())?;
    heap.free(freed.as_ptr(), Origin::caller())?;

    Ok(None)
}

fn overrun(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let p = heap.allocate(8, Origin::caller())?;
    // Off by one.
    unsafe { p.as_ptr().add(8).write(0) };

    Ok(heap.free(p.as_ptr(), Origin::caller()).err())
}

fn underrun(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let p = heap.allocate(8, Origin::caller())?;
    unsafe { p.as_ptr().sub(1).write(0) };

    Ok(heap.validate(p.as_ptr()).err())
}

fn double_free(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let p = heap.allocate(32, Origin::caller())?;
    heap.free(p.as_ptr(), Origin::caller())?;

    Ok(heap.free(p.as_ptr(), Origin::caller()).err())
}

fn stray(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let on_stack = [0u8; 8];

    Ok(heap.validate(on_stack.as_ptr()).err())
}

fn realloc(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    let p = heap.allocate(4, Origin::caller())?;
    unsafe { p.as_ptr().copy_from_nonoverlapping(b"abcd".as_ptr(), 4) };
    let Some(q) = heap.reallocate(p.as_ptr(), 64, Origin::caller())? else {
        bail!("growing returned null");
    };
    let kept = unsafe { std::slice::from_raw_parts(q.as_ptr(), 4) };
    ensure!(kept == b"abcd", "contents lost on realloc: {kept:?}");
    ensure!(heap.size_of(q.as_ptr()) == Some(64), "realloc'd block has the wrong size");
    ensure!(heap.reallocate(q.as_ptr(), 0, Origin::caller())?.is_none(), "realloc to 0 must free");

    Ok(None)
}

fn oom(heap: &mut CheckHeap) -> Result<Option<HeapError>> {
    match heap.allocate(OOM_REQUEST, Origin::caller()) {
        Ok(p)                                   => {
            heap.free(p.as_ptr(), Origin::caller())?;
            Ok(None)
        },
        Err(e @ HeapError::OutOfMemory { .. })  => Ok(Some(e)),
        Err(e)                                  => Err(e.into()),
    }
}

//-----SCENARIOS (END)---------------------
