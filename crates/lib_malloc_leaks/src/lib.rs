//! Companion crate to [`malloc_leaks`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the allocator calls issued by the program and redirect
//! them to the `malloc_leaks` tracker before invoking the original `libc` functions.
//!
//! The library also wraps `__libc_start_main`: the tracker is created and enabled when the
//! program reaches `main`.  The leak report is printed from this library's own `.fini_array`
//! entry: the dynamic loader finalizes the executable before the libraries it preloaded, so the
//! program's destructors and `atexit` handlers have already released their memory by then.

use std::{
    cell::{Cell, UnsafeCell},
    ptr,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use libc::{c_char, c_int, c_void, size_t, RTLD_NEXT};
use log::{error, warn};
use malloc_leaks::{
    config::{DEFAULT_LOG_FILTER, LOG_VAR},
    guard,
    symbols::{self, LIBC_START_MAIN},
    Config, ExecinfoUnwinder, LibcAllocator, ProcessMemory, RealAllocator, Tracker, Unwinder,
};
use once_cell::sync::OnceCell;

type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
type InitFn = Option<unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char)>;
type FiniFn = Option<unsafe extern "C" fn()>;
type ExitFn = extern "C" fn();
type LibcStartMainFn = unsafe extern "C" fn(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: InitFn,
    fini: FiniFn,
    rtld_fini: FiniFn,
    stack_end: *mut c_void,
) -> c_int;

static REAL: OnceCell<LibcAllocator> = OnceCell::new();
static TRACKER: OnceCell<Tracker<LibcAllocator>> = OnceCell::new();

static PROGRAM_MAIN: OnceCell<MainFn> = OnceCell::new();
static TORN_DOWN: AtomicBool = AtomicBool::new(false);

thread_local! {
    // Set while this thread looks up the real allocator.
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

// `dlsym` may allocate before the real allocator is known.  Those requests are served from a
// static arena that is never reclaimed.
const ARENA_SIZE: usize = 64 * 1024;
const ARENA_ALIGN: usize = 16;

#[repr(C, align(16))]
struct Arena(UnsafeCell<[u8; ARENA_SIZE]>);

unsafe impl Sync for Arena {}

static ARENA: Arena = Arena(UnsafeCell::new([0; ARENA_SIZE]));
static ARENA_USED: AtomicUsize = AtomicUsize::new(0);

fn arena_base() -> usize {
    ARENA.0.get() as usize
}

fn arena_alloc(size: usize) -> *mut c_void {
    let size = match size.max(1).checked_add(ARENA_ALIGN - 1) {
        Some(size) => size & !(ARENA_ALIGN - 1),
        None => return ptr::null_mut(),
    };
    let offset = ARENA_USED.fetch_add(size, Ordering::Relaxed);
    match offset.checked_add(size) {
        Some(end) if end <= ARENA_SIZE => (arena_base() + offset) as *mut c_void,
        _ => ptr::null_mut(),
    }
}

fn in_arena(ptr: *mut c_void) -> bool {
    let addr = ptr as usize;
    addr >= arena_base() && addr < arena_base() + ARENA_SIZE
}

// Writes `msg` to stderr without allocating and aborts.
fn die(msg: &str) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::abort()
    }
}

/// The allocator behind this library, or `None` while the calling thread is looking it up.
fn real() -> Option<&'static LibcAllocator> {
    if let Some(real) = REAL.get() {
        return Some(real);
    }
    if RESOLVING.with(Cell::get) {
        return None;
    }
    RESOLVING.with(|r| r.set(true));
    let real = REAL.get_or_init(|| match unsafe { LibcAllocator::next() } {
        Ok(real) => real,
        Err(_) => die("malloc_leaks: couldn't find original allocator\n"),
    });
    RESOLVING.with(|r| r.set(false));
    Some(real)
}

fn init_logging() {
    let env = env_logger::Env::new().filter_or(LOG_VAR, DEFAULT_LOG_FILTER);
    let _ = env_logger::Builder::from_env(env).try_init();
}

fn init_tracker() {
    let _suppressed = guard::suppress();
    init_logging();
    TRACKER.get_or_init(|| {
        let real = match real() {
            Some(real) => *real,
            None => die("malloc_leaks: allocator not resolved at startup\n"),
        };
        let unwinder = match unsafe { ExecinfoUnwinder::resolve() } {
            Ok(unwinder) => Some(Box::new(unwinder) as Box<dyn Unwinder>),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };
        Tracker::new(real, unwinder, Config::from_env())
    });
}

unsafe extern "C" fn set_up(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> c_int {
    if let Some(tracker) = TRACKER.get() {
        let _suppressed = guard::suppress();
        tracker.enter_main();
    }
    match PROGRAM_MAIN.get() {
        Some(main) => main(argc, argv, envp),
        None => die("malloc_leaks: program entry point lost\n"),
    }
}

#[used]
#[link_section = ".fini_array"]
static REPORT_AT_FINI: ExitFn = tear_down;

extern "C" fn tear_down() {
    if TORN_DOWN.swap(true, Ordering::AcqRel) {
        return;
    }
    let tracker = match TRACKER.get() {
        Some(tracker) => tracker,
        None => return,
    };
    let _suppressed = guard::suppress();
    // Keep the program's buffered output ahead of the report.
    unsafe { libc::fflush(ptr::null_mut()) };
    // Live blocks stay mapped: nothing frees them after this point.
    let memory = unsafe { ProcessMemory::new() };
    if let Err(e) = tracker.teardown(&memory) {
        error!("{}", e);
    }
}

/// Entry point wrapper: creates the tracker and enables it once the program reaches `main`.
///
/// # Safety
///
/// Called by the C runtime startup code with the arguments it would pass to the C library.
#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: InitFn,
    fini: FiniFn,
    rtld_fini: FiniFn,
    stack_end: *mut c_void,
) -> c_int {
    let real_start_main: LibcStartMainFn = match symbols::lookup(RTLD_NEXT, LIBC_START_MAIN) {
        Ok(sym) => std::mem::transmute::<*mut c_void, LibcStartMainFn>(sym),
        Err(_) => die("malloc_leaks: couldn't find original __libc_start_main\n"),
    };
    let _ = PROGRAM_MAIN.set(main);
    init_tracker();

    real_start_main(
        set_up,
        argc,
        argv,
        init,
        fini,
        rtld_fini,
        stack_end,
    )
}

/// When this library is loaded with `LD_PRELOAD`, this `malloc` implementation catches `malloc`
/// calls performed by the program and records them before invoking the original `libc` malloc.
///
/// # Safety
///
/// Same contract as [`libc::malloc`].
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    if let Some(tracker) = TRACKER.get() {
        return tracker.dispatcher().malloc(size);
    }
    match real() {
        Some(real) => real.malloc(size),
        None => arena_alloc(size),
    }
}

/// # Safety
///
/// Same contract as [`libc::calloc`].
#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, elem_size: size_t) -> *mut c_void {
    if let Some(tracker) = TRACKER.get() {
        return tracker.dispatcher().calloc(count, elem_size);
    }
    match real() {
        Some(real) => real.calloc(count, elem_size),
        // The arena is static, so it is already zeroed.
        None => match count.checked_mul(elem_size) {
            Some(size) => arena_alloc(size),
            None => ptr::null_mut(),
        },
    }
}

/// # Safety
///
/// Same contract as [`libc::realloc`].
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    if in_arena(ptr) {
        // Arena blocks don't record their size; copy as much as could belong to the old block.
        let new = malloc(size);
        if !new.is_null() {
            let available = arena_base() + ARENA_SIZE - ptr as usize;
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.cast::<u8>(), size.min(available));
        }
        return new;
    }
    if let Some(tracker) = TRACKER.get() {
        return tracker.dispatcher().realloc(ptr, size);
    }
    match real() {
        Some(real) => real.realloc(ptr, size),
        None => arena_alloc(size),
    }
}

/// # Safety
///
/// Same contract as [`libc::free`].
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || in_arena(ptr) {
        return;
    }
    if let Some(tracker) = TRACKER.get() {
        tracker.dispatcher().free(ptr);
    } else if let Some(real) = real() {
        real.free(ptr);
    }
}
