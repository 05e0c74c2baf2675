//! Per-thread recursion guard.
//!
//! While a thread's guard is suppressed, allocator calls made on that thread are forwarded
//! without being recorded.  The dispatcher suppresses the guard while it captures the caller
//! address and updates the statistics store, so allocations performed by the unwinder or by the
//! store itself never re-enter the tracking path.

use std::cell::Cell;

thread_local! {
    // Flag used to detect nested calls to the allocator.
    static SUPPRESSED: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if tracking is suppressed on the calling thread.
///
/// A thread that is being torn down and can no longer access its TLS reports `true`, so its
/// late allocator calls are passed through.
pub fn get() -> bool {
    SUPPRESSED.try_with(Cell::get).unwrap_or(true)
}

/// Sets the calling thread's suppression flag.
pub fn set(suppressed: bool) {
    // Ignore errors accessing the TLS when the thread is being destroyed.
    let _ = SUPPRESSED.try_with(|flag| flag.set(suppressed));
}

/// Suppresses tracking on the calling thread until the returned token is dropped.  The previous
/// state is restored on drop, so nested scopes behave.
pub fn suppress() -> Suppressed {
    let previous = get();
    set(true);
    Suppressed { previous }
}

#[must_use]
#[derive(Debug)]
pub struct Suppressed {
    previous: bool,
}

impl Drop for Suppressed {
    fn drop(&mut self) {
        set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::spawn;

    #[test]
    fn starts_unsuppressed() {
        assert!(!get());
    }

    #[test]
    fn set_and_get() {
        set(true);
        assert!(get());
        set(false);
        assert!(!get());
    }

    #[test]
    fn scoped_suppression_restores() {
        {
            let _outer = suppress();
            assert!(get());
            {
                let _inner = suppress();
                assert!(get());
            }
            // Inner scope must not clear the outer one.
            assert!(get());
        }
        assert!(!get());
    }

    #[test]
    fn state_is_per_thread() {
        set(true);
        let other = spawn(get).join().unwrap();
        assert!(!other);
        assert!(get());
        set(false);
    }
}
