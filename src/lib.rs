//! `malloc_leaks` tracks every `malloc`, `calloc`, `realloc` and `free` issued by a program and,
//! when the program exits, prints the allocations that were never freed along with aggregate
//! allocation statistics.
//!
//! Unlike a sampling heap profiler, `malloc_leaks` records every call.  Each live allocation is
//! remembered together with the return address of the code that requested it, so a leak can be
//! traced back to its origin.
//!
//! ## Using `malloc_leaks` via `LD_PRELOAD`
//!
//! The companion [`lib_malloc_leaks`] crate produces a dynamic library that intercepts the
//! allocator calls of any dynamically linked program, whatever language it is written in:
//!
//! ```bash
//! LD_PRELOAD=libmalloc_leaks_preload.so ./my_program
//! ```
//!
//! Tracking starts when the program reaches `main`.  Upon **normal** program termination, the
//! report is written to stdout:
//!
//! ```text
//! SUMMARY START
//!
//! Leaks dumped:
//!     1.) Address  : 0x55d0c1b2a2a0
//!         Hex dump : 2a 00 00 00
//!         Bytes    : 4
//!         Backtrace: 0x55d0c0e4f1b9
//!
//! Leaks count 1, bytes leaked 4
//!
//! In detail:
//!     malloc's  count:      1
//!     ...
//! SUMMARY END
//! ```
//!
//! The report destination can be changed with `MALLOC_LEAKS_OUTPUT=<file>`.  Setting
//! `MALLOC_LEAKS_DUMP_DIR=<dir>` additionally stores the report in
//! `<dir>/malloc_leaks.<pid>.yaml`, which the `ml_print` tool from this crate renders later,
//! optionally with symbol names for the leak origins:
//!
//! ```bash
//! ml_print --dir <dir> --symbols
//! ```
//!
//! ## Embedding
//!
//! The tracking engine does not depend on `LD_PRELOAD`.  A [`Tracker`] takes the allocator to
//! forward to as a [`RealAllocator`] and the stack unwinder as an [`Unwinder`], so it can be
//! driven by any interception mechanism.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod report;
pub mod stats;
pub mod symbols;
pub mod tracker;

pub use config::Config;
pub use dispatch::{Dispatcher, RealAllocator, Unwinder};
pub use error::{ReportError, ResolveError};
pub use report::{LeakReport, MemoryView, ProcessMemory};
pub use stats::{AllocationRecord, Category, CategoryCounters, Statistics};
pub use symbols::{ExecinfoUnwinder, LibcAllocator};
pub use tracker::Tracker;
