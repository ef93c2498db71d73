use std::ffi::CStr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use memshim::*;

// Every test works on the same process-wide heap.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    match SERIAL.lock() {
        Ok(g)   => g,
        Err(e)  => e.into_inner(),
    }
}

const FILE: &CStr = c"shim_test.c";

#[test]
fn classic_session() {
    let _g = serial();
    unsafe {
        mem_init();
        assert_eq!(mem_is_inited(), 1);

        let p = mem_malloc_debug(10, FILE.as_ptr(), 10).cast::<u8>();
        assert!(!p.is_null());
        p.write_bytes(b'a', 10);
        mem_checkptr(p.cast());
        mem_checkptr(p.add(9).cast());

        let z = mem_calloc_debug(32, FILE.as_ptr(), 11).cast::<u8>();
        assert!(std::slice::from_raw_parts(z, 32).iter().all(|&b| b == 0));

        let q = mem_realloc_debug(p.cast(), 20, FILE.as_ptr(), 12).cast::<u8>();
        assert_ne!(q, p);
        assert_eq!(std::slice::from_raw_parts(q, 10), &[b'a'; 10]);

        let s = mem_strdup_debug(c"hello".as_ptr(), FILE.as_ptr(), 13);
        assert_eq!(CStr::from_ptr(s), c"hello");
        mem_setnewfileline(s.cast(), c"elsewhere.c".as_ptr(), 99);
        let retagged = with_heap(|heap| {
            heap.blocks()
                .find(|b| b.payload().as_ptr() == s.cast::<u8>())
                .map(|b| (b.origin().file.to_string(), b.origin().line))
        });
        assert_eq!(retagged, Some(("elsewhere.c".to_string(), 99)));

        mem_check();
        assert_eq!(with_heap(|heap| heap.stats().live_count), 3);

        mem_free_debug(s.cast(), FILE.as_ptr(), 20);
        mem_free_debug(q.cast(), FILE.as_ptr(), 21);
        mem_freefp(z.cast());
        mem_free(std::ptr::null_mut());

        mem_term();
        assert_eq!(mem_is_inited(), 0);
    }
}

#[test]
fn plain_entry_points() {
    let _g = serial();
    unsafe {
        mem_init();
        let p = mem_malloc(8);
        let p = mem_realloc(p, 4);
        let z = mem_calloc(4);
        let s = mem_strdup(c"x".as_ptr());
        assert!(mem_strdup(std::ptr::null()).is_null());
        assert!(mem_realloc(std::ptr::null_mut(), 0).is_null());

        let file = with_heap(|heap| heap.blocks().next().map(|b| b.origin().file.to_string()));
        assert!(file.is_some_and(|f| f.ends_with("core.rs")));

        mem_free(s.cast());
        mem_free(z);
        assert!(mem_realloc(p, 0).is_null());
        mem_term();
    }
}

#[test]
fn retnull_policy_returns_null() {
    let _g = serial();
    unsafe {
        mem_init();
        mem_setexception(MEM_RETNULL, None);
        assert!(mem_malloc(usize::MAX).is_null());
        assert!(mem_calloc_debug(usize::MAX / 2, FILE.as_ptr(), 1).is_null());

        // A failed realloc keeps the old block alive.
        let p = mem_malloc(16);
        assert!(mem_realloc(p, usize::MAX).is_null());
        mem_checkptr(p);
        mem_free(p);

        mem_setexception(MEM_ABORTMSG, None);
        mem_term();
    }
}

static CALLS: AtomicUsize = AtomicUsize::new(0);
static CACHE: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());

unsafe extern "C" fn drop_cache_and_give_up() -> libc::c_int {
    CALLS.fetch_add(1, Ordering::SeqCst);
    let cache = CACHE.swap(std::ptr::null_mut(), Ordering::SeqCst);
    // Runs with the heap unlocked, so freeing from here must not deadlock.
    unsafe { mem_free(cache) };
    MEM_RETNULL
}

#[test]
fn handler_runs_outside_the_lock() {
    let _g = serial();
    unsafe {
        mem_init();
        CALLS.store(0, Ordering::SeqCst);
        CACHE.store(mem_malloc(64), Ordering::SeqCst);
        mem_setexception(MEM_CALLFP, Some(drop_cache_and_give_up));

        assert!(mem_malloc(usize::MAX).is_null());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(with_heap(|heap| heap.stats().live_count), 0);

        mem_setexception(MEM_ABORTMSG, None);
        mem_term();
    }
}

#[test]
fn init_is_idempotent() {
    let _g = serial();
    unsafe {
        mem_init();
        let p = mem_malloc(5);
        mem_init();
        // Still registered: the second init was a no-op.
        mem_checkptr(p);
        mem_free(p);
        mem_term();
        // Terminating twice is harmless.
        mem_term();
    }
}
