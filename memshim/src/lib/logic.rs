use crate::ffi::*;
use once_cell::sync::Lazy;
use std::sync::Mutex;

use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::ptr;

use guardheap::backend::LibcAlloc;
use guardheap::policy::MISSING_HANDLER;
use guardheap::{
    Event, ExceptionPolicy, Heap, HeapError, Leak, PolicyState, Reporter, TextReporter, Verdict,
};
use log::{debug, warn};

pub const REPORT_VAR: &str = "MEMGUARD_REPORT";
pub const PAUSE_VAR:  &str = "MEMGUARD_PAUSE";
pub const POLICY_VAR: &str = "MEMGUARD_POLICY";

pub type ShimHeap = Heap<LibcAlloc>;

/// Knobs read from the environment on first use of the shim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// Diagnostics go here; `stdout` if unset.
    pub report: Option<PathBuf>,
    /// Wait for Enter after each unfreed pointer at `mem_term`.
    pub pause:  bool,
    /// Out-of-memory behavior until the first `mem_setexception`.
    pub policy: PolicyState,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let report = lookup(REPORT_VAR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let pause = lookup(PAUSE_VAR).is_some_and(|v| !v.is_empty() && v != "0");
        let policy = match lookup(POLICY_VAR) {
            Some(raw)   => {
                match raw.to_str().and_then(parse_policy) {
                    Some(p) => p,
                    None    => {
                        warn!("{POLICY_VAR}={raw:?} not understood, using the default");
                        PolicyState::default()
                    }
                }
            },
            None        => PolicyState::default(),
        };

        Self { report, pause, policy }
    }
}

/// `callfp` is not accepted: a handler can only be set from C.
pub fn parse_policy(name: &str) -> Option<PolicyState> {
    match name.trim().to_ascii_lowercase().as_str() {
        "abortmsg"  => Some(PolicyState::AbortWithMessage),
        "abort"     => Some(PolicyState::AbortSilently),
        "retnull"   => Some(PolicyState::ReturnNull),
        "retry"     => Some(PolicyState::Retry),
        _           => None,
    }
}

static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);

static HEAP: Lazy<Mutex<ShimHeap>> = Lazy::new(|| Mutex::new(build_heap(&SETTINGS)));

// Kept apart from the heap: the handler runs with the heap unlocked, so
// that it may free memory through the shim.
static POLICY: Lazy<Mutex<(PolicyState, Option<CHandler>)>> = Lazy::new(|| {
    Mutex::new((SETTINGS.policy, None))
});

/// Passes everything on except out-of-memory events, which only matter
/// once the shim's own policy has had its say.
struct Muted<R: Reporter>(R);

impl<R: Reporter> Reporter for Muted<R> {
    fn report(&mut self, event: &Event) {
        if !matches!(event, Event::OutOfMemory { .. }) {
            self.0.report(event);
        }
    }
}

fn build_heap(settings: &Settings) -> ShimHeap {
    let sink: Box<dyn Write + Send> = match &settings.report {
        Some(path)  => {
            match File::create(path) {
                Ok(f)   => Box::new(f),
                Err(e)  => {
                    warn!("cannot open {}: {e}; reporting to stdout", path.display());
                    Box::new(io::stdout())
                }
            }
        },
        None        => Box::new(io::stdout()),
    };
    let mut heap = Heap::new(LibcAlloc).with_reporter(Muted(TextReporter::new(sink)));
    if settings.pause {
        heap = heap.with_pause(wait_for_key_press);
    }
    // The heap itself always gives up at once; `acquire` escalates.
    if let Err(e) = heap.set_exception_policy(PolicyState::ReturnNull, None) {
        graceful_exit(&e.to_string());
    }
    debug!("memshim heap built with {settings:?}");

    heap
}

fn wait_for_key_press(_: &Leak) {
    print!("Press Enter to continue...");
    let _ = io::stdout().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
}

/// Runs `f` on the process-wide heap.
pub fn with_heap<R>(f: impl FnOnce(&mut ShimHeap) -> R) -> R {
    let mut heap = match HEAP.lock() {
        Ok(heap)    => heap,
        Err(_)      => graceful_exit("Poisoned mutex upon heap access."),
    };

    f(&mut heap)
}

/// Anything but success is fatal on the C side.
pub fn assert_ok<T>(res: guardheap::Result<T>) -> T {
    match res {
        Ok(v)   => v,
        Err(e)  => fatal(&e.to_string()),
    }
}

/// Runs an allocating `request` until it succeeds or the exception policy
/// says otherwise. The policy (and any handler) runs with the heap
/// unlocked.
pub fn acquire(mut request: impl FnMut(&mut ShimHeap) -> guardheap::Result<*mut u8>) -> *mut u8 {
    loop {
        let (size, origin) = match with_heap(&mut request) {
            Ok(p)                                       => return p,
            Err(HeapError::OutOfMemory { size, origin }) => (size, origin),
            Err(e)                                      => fatal(&e.to_string()),
        };
        match escalate() {
            Verdict::Retry              => {},
            Verdict::ReturnNull         => {
                warn!("insufficient memory for alloc of {size} at {origin}");
                return ptr::null_mut();
            },
            Verdict::Abort { announce } => {
                if announce {
                    announce_oom();
                }
                unsafe { exit(EXIT_FAILURE) }
            },
        }
    }
}

fn escalate() -> Verdict {
    let (state, handler) = match POLICY.lock() {
        Ok(p)   => *p,
        Err(e)  => *e.into_inner(),
    };
    let handler = handler.map(|fp| move || policy_from_c(unsafe { fp() }));
    let mut policy = match ExceptionPolicy::new(state, handler) {
        Ok(p)   => p,
        Err(e)  => graceful_exit(&e.to_string()),
    };

    match policy.escalate() {
        Ok(verdict) => verdict,
        Err(e)      => graceful_exit(&e.to_string()),
    }
}

fn policy_from_c(raw: int) -> PolicyState {
    match PolicyState::try_from(raw) {
        Ok(state)   => state,
        Err(_)      => graceful_exit("Bad exception policy value."),
    }
}

pub fn set_exception(flag: int, handler: Option<CHandler>) {
    let state = policy_from_c(flag);
    if state == PolicyState::CallHandler && handler.is_none() {
        graceful_exit(MISSING_HANDLER);
    }
    let mut policy = match POLICY.lock() {
        Ok(p)   => p,
        Err(e)  => e.into_inner(),
    };
    *policy = (state, handler);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Settings {
        let vars: Vec<(String, OsString)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        Settings::from_lookup(|key| {
            vars.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })
    }

    #[test]
    fn empty_environment() {
        assert_eq!(settings(&[]), Settings::default());
        assert_eq!(Settings::default().policy, PolicyState::AbortWithMessage);
    }

    #[test]
    fn all_variables() {
        let s = settings(&[
            (REPORT_VAR, "/tmp/mem.log"),
            (PAUSE_VAR, "1"),
            (POLICY_VAR, "RetNull"),
        ]);
        assert_eq!(s.report, Some(PathBuf::from("/tmp/mem.log")));
        assert!(s.pause);
        assert_eq!(s.policy, PolicyState::ReturnNull);
    }

    #[test]
    fn zero_or_empty_means_no_pause() {
        assert!(!settings(&[(PAUSE_VAR, "0")]).pause);
        assert!(!settings(&[(PAUSE_VAR, "")]).pause);
        assert!(settings(&[(REPORT_VAR, "")]).report.is_none());
    }

    #[test]
    fn policy_names() {
        assert_eq!(parse_policy("abortmsg"), Some(PolicyState::AbortWithMessage));
        assert_eq!(parse_policy(" abort "), Some(PolicyState::AbortSilently));
        assert_eq!(parse_policy("retry"), Some(PolicyState::Retry));
        assert_eq!(parse_policy("callfp"), None);
        assert_eq!(settings(&[(POLICY_VAR, "bogus")]).policy, PolicyState::default());
    }

    #[test]
    fn constants_match_policy_states() {
        assert_eq!(
            [MEM_ABORTMSG, MEM_ABORT, MEM_RETNULL, MEM_CALLFP, MEM_RETRY],
            [0, 1, 2, 3, 4]
        );
        assert_eq!(policy_from_c(MEM_CALLFP), PolicyState::CallHandler);
    }
}
