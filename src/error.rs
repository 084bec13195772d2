use thiserror::Error;

/// Everything that can go wrong inside the allocator. Variants only carry
/// plain integers, since rendering them must not allocate (they get printed
/// from inside `malloc()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("node pool exhausted ({capacity} slots), raise MO_POOL_ORDER")]
    PoolExhausted { capacity: usize },

    #[error("mmap() of {pages} pages failed, errno = {errno}")]
    MapFailed { pages: usize, errno: i32 },

    #[error("munmap() at {addr:#x} failed, errno = {errno}")]
    UnmapFailed { addr: usize, errno: i32 },

    #[error("mprotect() at {addr:#x} failed, errno = {errno}")]
    ProtectFailed { addr: usize, errno: i32 },

    #[error("release of {ptr:#x}, which is not a live allocation (double free?)")]
    InvalidRelease { ptr: usize },

    #[error("{addr:#x} is not an occupied node of this pool")]
    ForeignNode { addr: usize },

    #[error("requested size overflows usize")]
    SizeOverflow,

    #[error("unsupported alignment {align}")]
    BadAlignment { align: usize },

    #[error("allocator re-entered while it was being initialized")]
    Reentrant,

    #[error("allocation index corrupted: {0}")]
    Corrupt(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// `errno` of the last failed libc call on this thread
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
