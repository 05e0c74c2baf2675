//! Allocation event dispatcher.
//!
//! Every intercepted allocator call goes through a [`Dispatcher`], which forwards it to the real
//! allocator, works out the effective size and caller, and records the outcome in the shared
//! [`Statistics`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use libc::c_void;

use crate::{
    config::Config,
    guard,
    stats::{Address, AllocationRecord, Category, Statistics},
};

/// Upper bound on the frames requested from the unwinder; the buffer lives on the stack.
pub const MAX_FRAMES: usize = 64;

/// The allocator that intercepted calls are forwarded to.
///
/// # Safety
///
/// Implementations must behave like the C `malloc` family: returned pointers are either null or
/// valid for the requested size, and `free`/`realloc` accept any pointer previously returned.
pub unsafe trait RealAllocator: Send + Sync {
    unsafe fn malloc(&self, size: usize) -> *mut c_void;
    unsafe fn calloc(&self, count: usize, elem_size: usize) -> *mut c_void;
    unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void;
    unsafe fn free(&self, ptr: *mut c_void);
}

/// Stack unwinding primitive.  Fills `frames` with return addresses, innermost first, and
/// returns how many were captured.
///
/// `frames[0]` is the return address into the function that called `backtrace`; frames of the
/// unwinder itself are never reported.
pub trait Unwinder: Send + Sync {
    fn backtrace(&self, frames: &mut [usize]) -> usize;
}

pub struct Dispatcher<A> {
    real: A,
    stats: Arc<Statistics>,
    unwinder: Option<Box<dyn Unwinder>>,
    frames_required: usize,
    caller_frame: usize,
    // Set once the profiled program reaches its entry point.
    entered: AtomicBool,
}

impl<A> fmt::Debug for Dispatcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("unwinder", &self.unwinder.is_some())
            .field("frames_required", &self.frames_required)
            .field("caller_frame", &self.caller_frame)
            .field("entered", &self.entered.load(Ordering::Relaxed))
            .finish()
    }
}

impl<A: RealAllocator> Dispatcher<A> {
    pub fn new(
        real: A,
        stats: Arc<Statistics>,
        unwinder: Option<Box<dyn Unwinder>>,
        config: &Config,
    ) -> Self {
        Dispatcher {
            real,
            stats,
            unwinder,
            frames_required: config.frames_required.min(MAX_FRAMES),
            caller_frame: config.caller_frame(),
            entered: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn real(&self) -> &A {
        &self.real
    }

    /// Called when the profiled program reaches its entry point.  Nothing is tracked before.
    pub fn enter_main(&self) {
        self.entered.store(true, Ordering::Release);
    }

    /// Whether a call made right now on this thread would be tracked.
    pub fn is_tracking(&self) -> bool {
        self.entered.load(Ordering::Acquire) && !guard::get()
    }

    // Must run with the recursion guard suppressed: the unwinder may allocate.
    //
    // `caller`, `record` and the allocating entry points are always inlined, so the unwinder is
    // called directly from the frame of the interception point that invoked the dispatcher.
    // Frame 0 is then that interception point and frame 1 is the code that called it.
    #[inline(always)]
    fn caller(&self) -> Option<Address> {
        let unwinder = self.unwinder.as_ref()?;
        if self.caller_frame >= self.frames_required {
            return None;
        }
        let mut frames = [0usize; MAX_FRAMES];
        let captured = unwinder.backtrace(&mut frames[..self.frames_required]);
        if captured >= self.frames_required {
            Some(frames[self.caller_frame])
        } else {
            None
        }
    }

    #[inline(always)]
    fn record(&self, category: Category, address: *mut c_void, size: u64) {
        let _suppressed = guard::suppress();
        let caller = self.caller();
        self.stats.count_call(category, size);
        // A failed call is counted, but there is nothing to leak.
        if !address.is_null() {
            self.stats
                .insert_allocation(address as Address, AllocationRecord { size, caller });
        }
    }

    /// # Safety
    ///
    /// Same contract as C `malloc`.
    #[inline(always)]
    pub unsafe fn malloc(&self, size: usize) -> *mut c_void {
        let tracking = self.is_tracking();
        let address = self.real.malloc(size);
        if tracking {
            self.record(Category::Malloc, address, size as u64);
        }
        address
    }

    /// # Safety
    ///
    /// Same contract as C `calloc`.
    #[inline(always)]
    pub unsafe fn calloc(&self, count: usize, elem_size: usize) -> *mut c_void {
        let tracking = self.is_tracking();
        let address = self.real.calloc(count, elem_size);
        if tracking {
            let size = (count as u64).wrapping_mul(elem_size as u64);
            self.record(Category::Calloc, address, size);
        }
        address
    }

    /// `realloc` may move the block, so the record is keyed by the returned address.  A zero
    /// `size` frees `ptr`: the call is counted but no record is created.
    ///
    /// # Safety
    ///
    /// Same contract as C `realloc`.
    #[inline(always)]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        if guard::get() {
            return self.real.realloc(ptr, size);
        }
        let tracking = self.is_tracking();

        // Drop the old record before the block can be handed out to another thread.
        let previous = self.stats.remove_allocation(ptr as Address);
        let address = self.real.realloc(ptr, size);
        let failed = size != 0 && address.is_null();
        if failed {
            if let Some(record) = previous {
                // The old block is untouched when realloc fails.
                let _suppressed = guard::suppress();
                self.stats.insert_allocation(ptr as Address, record);
            }
        }

        if tracking {
            let _suppressed = guard::suppress();
            let caller = self.caller();
            self.stats.count_call(Category::Realloc, size as u64);
            if size != 0 && !failed {
                self.stats.insert_allocation(
                    address as Address,
                    AllocationRecord {
                        size: size as u64,
                        caller,
                    },
                );
            }
        }
        address
    }

    /// Removes `ptr` from the live map whether or not it was tracked when allocated.  Unknown
    /// addresses are silently ignored.
    ///
    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        // Frees issued by the tracker's own bookkeeping never had a record.
        if !guard::get() {
            self.stats.remove_allocation(ptr as Address);
        }
        self.real.free(ptr);
    }
}
