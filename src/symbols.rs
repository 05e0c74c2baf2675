//! Runtime lookup of the functions the tracker forwards to: the real allocator, found behind the
//! preload library with `RTLD_NEXT`, and the C library's `backtrace`.

use std::ffi::CStr;

use libc::{c_int, c_void, dlsym, size_t, RTLD_DEFAULT, RTLD_NEXT};

use crate::{
    dispatch::{RealAllocator, Unwinder, MAX_FRAMES},
    error::ResolveError,
};

pub type MallocFn = unsafe extern "C" fn(size: size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(count: size_t, elem_size: size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);
pub type BacktraceFn = unsafe extern "C" fn(buffer: *mut *mut c_void, size: c_int) -> c_int;

pub const MALLOC: &CStr = c"malloc";
pub const CALLOC: &CStr = c"calloc";
pub const REALLOC: &CStr = c"realloc";
pub const FREE: &CStr = c"free";
pub const BACKTRACE: &CStr = c"backtrace";
pub const LIBC_START_MAIN: &CStr = c"__libc_start_main";

/// Looks up `name` in `handle` (`RTLD_NEXT`, `RTLD_DEFAULT` or a `dlopen` handle).
///
/// # Safety
///
/// `dlsym` may call back into the allocator.  Callers running inside an allocator hook must be
/// able to serve those calls without recursing into this function.
pub unsafe fn lookup(handle: *mut c_void, name: &'static CStr) -> Result<*mut c_void, ResolveError> {
    let sym = dlsym(handle, name.as_ptr());
    if sym.is_null() {
        Err(ResolveError::Missing(name))
    } else {
        Ok(sym)
    }
}

/// The C allocator, called through function pointers.
#[derive(Clone, Copy, Debug)]
pub struct LibcAllocator {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
}

impl LibcAllocator {
    /// The allocator this library was linked against.
    pub fn system() -> Self {
        LibcAllocator {
            malloc: libc::malloc,
            calloc: libc::calloc,
            realloc: libc::realloc,
            free: libc::free,
        }
    }

    /// The next definitions of the allocator functions after the calling library, i.e. the ones
    /// a preloaded library overrides.
    ///
    /// # Safety
    ///
    /// See [`lookup`].
    pub unsafe fn next() -> Result<Self, ResolveError> {
        Ok(LibcAllocator {
            malloc: std::mem::transmute::<*mut c_void, MallocFn>(lookup(RTLD_NEXT, MALLOC)?),
            calloc: std::mem::transmute::<*mut c_void, CallocFn>(lookup(RTLD_NEXT, CALLOC)?),
            realloc: std::mem::transmute::<*mut c_void, ReallocFn>(lookup(RTLD_NEXT, REALLOC)?),
            free: std::mem::transmute::<*mut c_void, FreeFn>(lookup(RTLD_NEXT, FREE)?),
        })
    }
}

unsafe impl RealAllocator for LibcAllocator {
    unsafe fn malloc(&self, size: usize) -> *mut c_void {
        (self.malloc)(size)
    }

    unsafe fn calloc(&self, count: usize, elem_size: usize) -> *mut c_void {
        (self.calloc)(count, elem_size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        (self.realloc)(ptr, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

/// `backtrace(3)` from the C library, if the process has one.
#[derive(Clone, Copy, Debug)]
pub struct ExecinfoUnwinder {
    backtrace: BacktraceFn,
}

impl ExecinfoUnwinder {
    /// # Safety
    ///
    /// See [`lookup`].
    pub unsafe fn resolve() -> Result<Self, ResolveError> {
        let sym = lookup(RTLD_DEFAULT, BACKTRACE)?;
        Ok(ExecinfoUnwinder {
            backtrace: std::mem::transmute::<*mut c_void, BacktraceFn>(sym),
        })
    }
}

impl Unwinder for ExecinfoUnwinder {
    // Kept out of line: the first address `backtrace(3)` reports is the return address into this
    // function, which is dropped.
    #[inline(never)]
    fn backtrace(&self, frames: &mut [usize]) -> usize {
        let mut buffer = [0usize; MAX_FRAMES + 1];
        let wanted = frames.len().min(MAX_FRAMES) + 1;
        // `usize` and `void *` have the same layout.
        let captured = unsafe {
            (self.backtrace)(buffer.as_mut_ptr().cast::<*mut c_void>(), wanted as c_int)
        };
        let captured = usize::try_from(captured).unwrap_or(0).saturating_sub(1);
        frames[..captured].copy_from_slice(&buffer[1..=captured]);
        captured
    }
}
