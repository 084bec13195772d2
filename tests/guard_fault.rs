//! The guard pages are the whole point, so check that they actually fault.
//! Each probe runs in a forked child; the parent only looks at how it died.

use std::ptr::NonNull;

use guardmalloc::{Config, Context};
use libc::{c_int, SIGSEGV};

/// Run `probe` in a child process, return the signal that killed it (or
/// `None` if it exited normally).
fn died_of(probe: impl FnOnce()) -> Option<c_int> {
    // SAFETY: the child only touches memory and then `_exit()`s, which is
    // fine even though the parent has other threads
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork() failed");
    if pid == 0 {
        // No core files for the faults we provoke on purpose
        let no_core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        unsafe {
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
        }
        probe();
        unsafe { libc::_exit(0) };
    }
    let mut status = 0;
    // SAFETY: `pid` is our child
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    if libc::WIFSIGNALED(status) {
        Some(libc::WTERMSIG(status))
    } else {
        assert_eq!(libc::WEXITSTATUS(status), 0);
        None
    }
}

fn exact_fit() -> Context {
    Context::new(Config::default().pool_order(8).alignment(1)).unwrap()
}

fn touch(ptr: NonNull<u8>, offset: usize) {
    // SAFETY: deliberately unchecked, faulting is what we're testing
    unsafe { ptr.as_ptr().add(offset).write_volatile(0xee) };
}

const SIZES: [usize; 8] = [1, 7, 4095, 4096, 4097, 65_537, 1_000_003, 10_000_000];

#[test]
fn whole_block_is_writable() {
    let ctx = exact_fit();
    for size in SIZES {
        let ptr = ctx.allocate(size).unwrap().unwrap();
        let signal = died_of(|| {
            touch(ptr, 0);
            touch(ptr, size / 2);
            touch(ptr, size - 1);
        });
        assert_eq!(signal, None, "size {size}");
        ctx.release(ptr.as_ptr()).unwrap();
    }
}

#[test]
fn one_byte_overrun_faults() {
    let ctx = exact_fit();
    for size in SIZES {
        let ptr = ctx.allocate(size).unwrap().unwrap();
        assert_eq!(died_of(|| touch(ptr, size)), Some(SIGSEGV), "size {size}");
        ctx.release(ptr.as_ptr()).unwrap();
    }
}

#[test]
fn default_alignment_faults_after_the_slack() {
    let ctx = Context::new(Config::default().pool_order(8)).unwrap();
    let ptr = ctx.allocate(13).unwrap().unwrap();
    // 13 rounds up to 16, so bytes 13..16 are slack and 16 is the guard page
    assert_eq!(died_of(|| touch(ptr, 15)), None);
    assert_eq!(died_of(|| touch(ptr, 16)), Some(SIGSEGV));
}

#[test]
fn use_after_free_faults_while_cached() {
    let ctx = Context::new(Config::default().pool_order(8).recycle(true)).unwrap();
    let ptr = ctx.allocate(5000).unwrap().unwrap();
    touch(ptr, 0);
    ctx.release(ptr.as_ptr()).unwrap();
    assert_eq!(ctx.stats().cached, 1);
    assert_eq!(died_of(|| touch(ptr, 0)), Some(SIGSEGV));

    // Handing the mapping out again makes it usable again
    let again = ctx.allocate(5000).unwrap().unwrap();
    assert_eq!(again, ptr);
    assert_eq!(died_of(|| touch(again, 4999)), None);
}

#[test]
fn use_after_free_faults_when_unmapped() {
    let ctx = Context::new(Config::default().pool_order(8).recycle(false)).unwrap();
    let ptr = ctx.allocate(100).unwrap().unwrap();
    ctx.release(ptr.as_ptr()).unwrap();
    assert_eq!(died_of(|| touch(ptr, 0)), Some(SIGSEGV));
}
