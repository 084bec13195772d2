//! C-ABI allocator symbols over the process-wide allocator. Build with the
//! `interpose` feature and link (or preload) the result to replace the libc
//! allocator.
//!
//! Overflowing size arithmetic gets the usual `NULL` + `ENOMEM`; everything
//! else that goes wrong aborts, like [`GuardAlloc`](crate::GuardAlloc).
//!
//! The first call also registers `pthread_atfork()` handlers that hold every
//! allocator lock across `fork()`, so a child forked while another thread
//! was mid-`malloc()` doesn't inherit a lock nobody will ever release.

use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{c_int, c_void, size_t, EINVAL, ENOMEM};

use crate::{
    context::Context,
    error::{Error, Result},
    global::{context, or_abort},
};

static FORK_HANDLERS: AtomicBool = AtomicBool::new(false);

/// The process allocator, with the fork handlers in place
fn process(op: &str) -> &'static Context {
    let ctx = or_abort(op, context());
    if !FORK_HANDLERS.load(Ordering::Acquire) && !FORK_HANDLERS.swap(true, Ordering::AcqRel) {
        // May call back into malloc(), which is fine now that the context
        // exists and we hold no lock
        // SAFETY: plain function pointers with static lifetime
        unsafe { libc::pthread_atfork(Some(before_fork), Some(after_fork), Some(after_fork)) };
    }
    ctx
}

unsafe extern "C" fn before_fork() {
    if let Ok(ctx) = context() {
        ctx.lock_for_fork();
    }
}

/// Runs in both the parent and the child
unsafe extern "C" fn after_fork() {
    if let Ok(ctx) = context() {
        // SAFETY: `before_fork()` took the locks on this thread, and in the
        // child this is the only thread
        unsafe { ctx.unlock_after_fork() };
    }
}

fn set_errno(value: c_int) {
    // SAFETY: always valid for the calling thread
    unsafe { *libc::__errno_location() = value };
}

/// `NULL` + `ENOMEM` for overflowed sizes, abort for anything else
fn to_c(op: &str, result: Result<Option<NonNull<u8>>>) -> *mut c_void {
    match result {
        Ok(ptr) => ptr.map_or(ptr::null_mut(), |p| p.as_ptr() as *mut c_void),
        Err(Error::SizeOverflow) => {
            set_errno(ENOMEM);
            ptr::null_mut()
        }
        Err(e) => or_abort(op, Err(e)),
    }
}

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    let ctx = process("malloc");
    to_c("malloc", ctx.allocate(size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let ctx = process("free");
    or_abort("free", ctx.release(ptr as *mut u8))
}

#[no_mangle]
pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    let ctx = process("calloc");
    to_c("calloc", ctx.zero_allocate(count, size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let ctx = process("realloc");
    to_c("realloc", ctx.resize(ptr as *mut u8, size))
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn reallocarray(ptr: *mut c_void, count: size_t, size: size_t) -> *mut c_void {
    let ctx = process("reallocarray");
    to_c("reallocarray", ctx.resize_array(ptr as *mut u8, count, size))
}

/// # Safety
///
/// `out` must be valid for a pointer-sized write.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(out: *mut *mut c_void, align: size_t, size: size_t) -> c_int {
    if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
        return EINVAL;
    }
    let ctx = process("posix_memalign");
    let ptr = match ctx.allocate_aligned(size, align) {
        Ok(ptr) => ptr.map_or(ptr::null_mut(), |p| p.as_ptr() as *mut c_void),
        Err(Error::BadAlignment { .. }) => return EINVAL,
        Err(Error::SizeOverflow) => return ENOMEM,
        Err(e) => or_abort("posix_memalign", Err(e)),
    };
    // SAFETY: contract passed to the caller
    unsafe { *out = ptr };
    0
}

#[no_mangle]
pub extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    let ctx = process("aligned_alloc");
    match ctx.allocate_aligned(size, align) {
        Err(Error::BadAlignment { .. }) => {
            set_errno(EINVAL);
            ptr::null_mut()
        }
        result => to_c("aligned_alloc", result),
    }
}

/// The size that was asked for, 0 for null or unknown pointers
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    let ctx = process("malloc_usable_size");
    ctx.usable_size(ptr as *const u8).unwrap_or(0)
}
