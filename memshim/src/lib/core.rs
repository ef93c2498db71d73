use crate::ffi::*;
use crate::logic;

use std::ffi::CStr;
use std::ptr::{self, NonNull};

use guardheap::Origin;

// The non-debug entry points blame the shim itself, the way a C macro
// expanding to `__FILE__`/`__LINE__` inside the library would.
macro_rules! here {
    () => {
        Origin::new(file!(), line!())
    };
}

fn raw(p: Option<NonNull<u8>>) -> *mut u8 {
    p.map_or(ptr::null_mut(), NonNull::as_ptr)
}

#[no_mangle]
/// Resets the tracked heap. Nothing happens if it is initialized already.
pub unsafe extern "C"
fn mem_init() {
    logic::with_heap(|heap| heap.initialize());
}

#[no_mangle]
/// Prints every unfreed pointer and the peak. In debug builds, any leak is
/// a failed assertion.
pub unsafe extern "C"
fn mem_term() {
    let report = logic::with_heap(|heap| heap.terminate());
    debug_assert!(
        report.is_clean(),
        "mem_term: {} allocations still live",
        report.leaks.len()
    );
}

#[no_mangle]
pub unsafe extern "C"
fn mem_is_inited() -> int {
    logic::with_heap(|heap| heap.is_initialized()) as int
}

#[no_mangle]
/// `flag` is one of the `MEM_*` constants; `handler` is mandatory for
/// `MEM_CALLFP` and ignored otherwise.
pub unsafe extern "C"
fn mem_setexception(flag: int, handler: Option<CHandler>) {
    logic::set_exception(flag, handler);
}

//-----DEBUG ENTRY POINTS (START)---------------------

#[no_mangle]
pub unsafe extern "C"
fn mem_malloc_debug(n: size_t, file: *const char, line: int) -> *mut void {
    let origin = unsafe { c_origin(file, line) };
    logic::acquire(|heap| heap.allocate(n, origin.clone()).map(NonNull::as_ptr)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_calloc_debug(n: size_t, file: *const char, line: int) -> *mut void {
    let origin = unsafe { c_origin(file, line) };
    logic::acquire(|heap| heap.allocate_zeroed(n, origin.clone()).map(NonNull::as_ptr)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_realloc_debug(p: *mut void, n: size_t, file: *const char, line: int) -> *mut void {
    let origin = unsafe { c_origin(file, line) };
    logic::acquire(|heap| heap.reallocate(p.cast(), n, origin.clone()).map(raw)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_free_debug(p: *mut void, file: *const char, line: int) {
    let origin = unsafe { c_origin(file, line) };
    logic::assert_ok(logic::with_heap(|heap| heap.free(p.cast(), origin)));
}

#[no_mangle]
pub unsafe extern "C"
fn mem_strdup_debug(s: *const char, file: *const char, line: int) -> *mut char {
    let origin = unsafe { c_origin(file, line) };
    let bytes = (!s.is_null()).then(|| unsafe { CStr::from_ptr(s) }.to_bytes());
    logic::acquire(|heap| heap.duplicate_string(bytes, origin.clone()).map(raw)).cast()
}

//-----DEBUG ENTRY POINTS (END)---------------------

#[no_mangle]
pub unsafe extern "C"
fn mem_malloc(n: size_t) -> *mut void {
    logic::acquire(|heap| heap.allocate(n, here!()).map(NonNull::as_ptr)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_calloc(n: size_t) -> *mut void {
    logic::acquire(|heap| heap.allocate_zeroed(n, here!()).map(NonNull::as_ptr)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_realloc(p: *mut void, n: size_t) -> *mut void {
    logic::acquire(|heap| heap.reallocate(p.cast(), n, here!()).map(raw)).cast()
}

#[no_mangle]
pub unsafe extern "C"
fn mem_free(p: *mut void) {
    logic::assert_ok(logic::with_heap(|heap| heap.free(p.cast(), here!())));
}

#[no_mangle]
/// Same as [`mem_free`], for use where a function pointer is needed.
pub unsafe extern "C"
fn mem_freefp(p: *mut void) {
    unsafe { mem_free(p) }
}

#[no_mangle]
pub unsafe extern "C"
fn mem_strdup(s: *const char) -> *mut char {
    let bytes = (!s.is_null()).then(|| unsafe { CStr::from_ptr(s) }.to_bytes());
    logic::acquire(|heap| heap.duplicate_string(bytes, here!()).map(raw)).cast()
}

//-----CHECKS (START)---------------------

#[no_mangle]
/// Aborts on the first live block with a trampled sentinel.
pub unsafe extern "C"
fn mem_check() {
    logic::assert_ok(logic::with_heap(|heap| heap.check_all()));
}

#[no_mangle]
/// Aborts unless `p` points into a live, intact block.
pub unsafe extern "C"
fn mem_checkptr(p: *mut void) {
    logic::assert_ok(logic::with_heap(|heap| heap.validate(p.cast_const().cast())));
}

#[no_mangle]
/// Blames `file`/`line` for the block at `p` from now on.
pub unsafe extern "C"
fn mem_setnewfileline(p: *mut void, file: *const char, line: int) {
    let origin = unsafe { c_origin(file, line) };
    logic::assert_ok(logic::with_heap(|heap| heap.retag_origin(p.cast_const().cast(), origin)));
}

//-----CHECKS (END)---------------------
