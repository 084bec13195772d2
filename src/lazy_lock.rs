use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{sync::FutexMutex, util::hint::cold};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. This is only really useful
    /// when checking the state inside the initializer...
    Initializing,
}

impl LazyLockState {
    fn from_u8(n: u8) -> Self {
        match n {
            0 => Self::Uninit,
            1 => Self::Init,
            _ => Self::Initializing,
        }
    }
}

/// A LazyLock that lets you poll its initialization state (including
/// mid-init), and that notices when the initializer calls back into itself.
///
/// `std::sync::LazyLock` would deadlock (or panic) in that case, and panicking
/// inside `malloc()` is not an option. Here the re-entrant caller just gets
/// `None`.
pub struct LazyLock<T, F = fn() -> T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    lock: FutexMutex<()>,
    state: AtomicU8,
    /// `pthread_self()` of the thread running `init`, 0 otherwise
    initializer: AtomicUsize,
    init: F,
}

// SAFETY: the cell is written exactly once, under `lock`, before `state` is
// published as `Init` with release ordering. Afterwards it is only read.
unsafe impl<T, F> Sync for LazyLock<T, F>
where
    T: Send + Sync,
    F: Sync,
{
}

impl<T, F> LazyLock<T, F>
where
    F: Fn() -> T,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            lock: FutexMutex::new(()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
            initializer: AtomicUsize::new(0),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// # Safety
    ///
    /// `LazyLock::state(self)` must be `Init`
    pub unsafe fn assume_init(&self) -> &T {
        // This borrow is not needless
        #[allow(clippy::needless_borrow)]
        unsafe {
            (&*self.cell.get()).assume_init_ref()
        }
    }

    /// Run the initializer if nobody has yet, and return the value. Returns
    /// `None` only when called from inside the initializer itself.
    pub fn initialize(&self) -> Option<&T> {
        if LazyLock::state(self) != LazyLockState::Init {
            cold(|| self.initialize_slow())?;
        }
        // SAFETY: state is `Init`, either we saw it on the fast path or
        // `initialize_slow()` returned `Some`
        Some(unsafe { self.assume_init() })
    }

    fn initialize_slow(&self) -> Option<()> {
        let me = current_thread();
        if LazyLock::state(self) == LazyLockState::Initializing
            && self.initializer.load(Ordering::Acquire) == me
        {
            return None;
        }
        let _guard = self.lock.lock();
        if LazyLock::state(self) == LazyLockState::Init {
            // Somebody else finished while we were waiting
            return Some(());
        }
        self.initializer.store(me, Ordering::Release);
        self.state
            .store(LazyLockState::Initializing as u8, Ordering::Release);
        let value = (self.init)();
        // SAFETY: we hold `lock` and state is not `Init`, so nobody is
        // reading or writing the cell
        unsafe { *self.cell.get() = MaybeUninit::new(value) };
        self.initializer.store(0, Ordering::Release);
        self.state.store(LazyLockState::Init as u8, Ordering::Release);
        Some(())
    }
}

fn current_thread() -> usize {
    // SAFETY: always safe to call
    unsafe { libc::pthread_self() as usize }
}
