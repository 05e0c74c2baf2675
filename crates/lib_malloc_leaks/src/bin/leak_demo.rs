//! Small program to run under the preload library: leaks one block from a known function and
//! releases another one from its own finalizer, after `main` returned.

use std::{
    hint::black_box,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use libc::c_void;

const LEAKED_SIZE: usize = 64;
const LEAKED_FILL: u8 = 0xa5;
const FINALIZED_SIZE: usize = 48;
const FINALIZED_FILL: u8 = 0x5a;

static RELEASED_AT_EXIT: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

extern "C" fn release_at_exit() {
    let block = RELEASED_AT_EXIT.swap(ptr::null_mut(), Ordering::AcqRel);
    unsafe { libc::free(block) };
}

#[used]
#[link_section = ".fini_array"]
static RELEASE_AT_EXIT: extern "C" fn() = release_at_exit;

unsafe fn fill(block: *mut c_void, size: usize, byte: u8) -> *mut c_void {
    if !block.is_null() {
        ptr::write_bytes(block.cast::<u8>(), byte, size);
    }
    block
}

#[inline(never)]
fn leak_in_helper() -> *mut c_void {
    let block = unsafe { libc::malloc(LEAKED_SIZE) };
    black_box(unsafe { fill(block, LEAKED_SIZE, LEAKED_FILL) })
}

fn main() {
    leak_in_helper();
    let block = unsafe { fill(libc::malloc(FINALIZED_SIZE), FINALIZED_SIZE, FINALIZED_FILL) };
    RELEASED_AT_EXIT.store(block, Ordering::Release);
}
