//! The process-wide allocator, and the [`GlobalAlloc`] face of it.
//!
//! Nothing is set up at load time. The first call into [`context()`] reads
//! the `MO_*` environment variables and maps the node pool; every call after
//! that just loads the initialized state.

use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use crate::{
    config::Config,
    context::Context,
    error::{Error, Result},
    lazy_lock::LazyLock,
    putln,
    util::hint::cold,
};

static CONTEXT: LazyLock<Result<Context>> = LazyLock::new(|| Context::new(Config::from_env()));

/// The process-wide allocator, initialized on first use.
///
/// Fails if initialization itself failed (the pool could not be mapped), or
/// if called from inside initialization.
pub fn context() -> Result<&'static Context> {
    match CONTEXT.initialize() {
        Some(Ok(ctx)) => Ok(ctx),
        Some(Err(e)) => Err(*e),
        None => Err(Error::Reentrant),
    }
}

/// Report `error` on stderr and abort. Resource exhaustion and bad frees are
/// bugs we exist to surface, so we never paper over them.
#[cold]
pub fn fatal(op: &str, error: Error) -> ! {
    putln!("guardmalloc: {op}: {error}");
    std::process::abort()
}

/// Unwrap a result from the process allocator, aborting on error
pub(crate) fn or_abort<T>(op: &str, result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => cold(|| fatal(op, e)),
    }
}

fn null_or(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Routes Rust allocations through the guard-page allocator.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: guardmalloc::GuardAlloc = guardmalloc::GuardAlloc;
/// ```
///
/// Allocation failure and releasing an unknown pointer abort the process.
pub struct GuardAlloc;

unsafe impl GlobalAlloc for GuardAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ctx = or_abort("alloc", context());
        null_or(or_abort(
            "alloc",
            ctx.allocate_aligned(layout.size(), layout.align()),
        ))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ctx = or_abort("alloc_zeroed", context());
        null_or(or_abort(
            "alloc_zeroed",
            ctx.zero_allocate_aligned(layout.size(), layout.align()),
        ))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        let ctx = or_abort("dealloc", context());
        or_abort("dealloc", ctx.release(ptr))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ctx = or_abort("realloc", context());
        null_or(or_abort(
            "realloc",
            ctx.resize_aligned(ptr, new_size, layout.align()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_context_is_shared() {
        let a = context().unwrap() as *const Context;
        let b = std::thread::spawn(|| context().unwrap() as *const Context as usize)
            .join()
            .unwrap();
        assert_eq!(a as usize, b);
    }

    #[test]
    fn guard_alloc_round_trip() {
        let layout = Layout::from_size_align(100, 16).unwrap();
        unsafe {
            let p = GuardAlloc.alloc_zeroed(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0);
            assert!(std::slice::from_raw_parts(p, 100).iter().all(|b| *b == 0));
            p.write_bytes(7, 100);
            let q = GuardAlloc.realloc(p, layout, 5000);
            assert_eq!(q as usize % 16, 0);
            assert_eq!(*q.add(99), 7);
            assert_eq!(context().unwrap().usable_size(q), Some(5000));
            GuardAlloc.dealloc(q, Layout::from_size_align(5000, 16).unwrap());
            assert!(context().unwrap().block(q).is_none());
        }
    }
}
