// C-reminiscent types.
pub type size_t     = libc::size_t;
pub type void       = libc::c_void;
pub type int        = libc::c_int;
pub type char       = libc::c_char;

use std::borrow::Cow;
use std::ffi::CStr;

pub use libc::{exit, fflush, fputs, EXIT_FAILURE};
use libc_stdhandle::stdout;

use guardheap::{Origin, PolicyState};

/// Out-of-memory handler as registered through `mem_setexception`. Its
/// return value is one of the `MEM_*` constants below.
pub type CHandler = unsafe extern "C" fn() -> int;

pub const MEM_ABORTMSG: int = PolicyState::AbortWithMessage as int;
pub const MEM_ABORT:    int = PolicyState::AbortSilently as int;
pub const MEM_RETNULL:  int = PolicyState::ReturnNull as int;
pub const MEM_CALLFP:   int = PolicyState::CallHandler as int;
pub const MEM_RETRY:    int = PolicyState::Retry as int;

const OOM_LINE: &CStr = c"Fatal error: out of memory\n";

pub unsafe fn c_origin(file: *const char, line: int) -> Origin {
    //! Turns a `__FILE__`/`__LINE__` pair into an [`Origin`]. The file name
    //! is copied: C callers are free to pass a temporary.
    let file = if file.is_null() {
        Cow::Borrowed("unknown")
    } else {
        Cow::Owned(unsafe { CStr::from_ptr(file) }.to_string_lossy().into_owned())
    };

    Origin::new(file, u32::try_from(line).unwrap_or(0))
}

pub fn graceful_exit(err_msg: &str) -> ! {
    //! Prints some error message on stderr, then
    //! exits with non-zero code.
    eprintln!("{}", err_msg);
    unsafe { exit(EXIT_FAILURE) }
}

pub fn fatal(err_msg: &str) -> ! {
    //! What a failed `assert` does: the diagnostic has already gone
    //! out through the heap's reporter, so say why and abort.
    eprintln!("memshim: {}", err_msg);
    std::process::abort()
}

pub fn announce_oom() {
    //! Written straight to the C library's `stdout`, without
    //! allocating anything.
    unsafe {
        let out = stdout();
        fputs(OOM_LINE.as_ptr(), out);
        fflush(out);
    }
}
