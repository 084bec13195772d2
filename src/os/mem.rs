use std::{
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use libc::{
    c_int, c_void, mmap, mprotect, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE,
    PROT_NONE, PROT_READ, PROT_WRITE,
};
use once_cell::race::OnceNonZeroUsize;

use crate::{
    error::{errno, Error, Result},
    util::num::round_up,
};

static PAGE_SIZE: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// Only used if the OS reports a page size of 0, which it shouldn't
const FALLBACK_PAGE_SIZE: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => unreachable!(),
};

/// The system page size, asked for once. `OnceNonZeroUsize` never blocks or
/// allocates, racing threads just both ask the OS.
pub fn page_size() -> usize {
    PAGE_SIZE
        .get_or_init(|| NonZeroUsize::new(page_size::get()).unwrap_or(FALLBACK_PAGE_SIZE))
        .get()
}

/// Access rights for a run of pages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadWrite,
}

impl Protection {
    fn bits(self) -> c_int {
        match self {
            Protection::None => PROT_NONE,
            Protection::ReadWrite => PROT_READ | PROT_WRITE,
        }
    }
}

/// `mmap()` `len` bytes of private, anonymous, read/write memory.
pub fn map_anonymous(len: usize, flags: c_int) -> Result<NonNull<u8>> {
    // SAFETY: anonymous mapping at a kernel-chosen address, no fd, touches
    // nothing that exists already
    let ptr = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        return Err(Error::MapFailed {
            pages: len / page_size(),
            errno: errno(),
        });
    }
    NonNull::new(ptr as *mut u8).ok_or(Error::MapFailed {
        pages: len / page_size(),
        errno: 0,
    })
}

/// # Safety
///
/// `[addr, addr + len)` must be a range we mapped and nobody will touch again.
pub unsafe fn unmap(addr: NonNull<u8>, len: usize) -> Result<()> {
    // SAFETY: contract passed to the caller
    if unsafe { munmap(addr.as_ptr() as *mut c_void, len) } != 0 {
        return Err(Error::UnmapFailed {
            addr: addr.as_ptr() as usize,
            errno: errno(),
        });
    }
    Ok(())
}

/// # Safety
///
/// `[addr, addr + len)` must be mapped by us, page aligned, and nobody may
/// hold references into it that outlive a switch to [`Protection::None`].
pub unsafe fn protect(addr: NonNull<u8>, len: usize, prot: Protection) -> Result<()> {
    // SAFETY: contract passed to the caller
    if unsafe { mprotect(addr.as_ptr() as *mut c_void, len, prot.bits()) } != 0 {
        return Err(Error::ProtectFailed {
            addr: addr.as_ptr() as usize,
            errno: errno(),
        });
    }
    Ok(())
}

/// An owned, page-aligned, read/write mapping that is unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the region is plain memory, ownership of the mapping can move
// between threads
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned arena of memory of `size` bytes (or
    /// more -- the resulting arena is rounded up to whole pages). Pages are
    /// not reserved up front, so untouched parts cost nothing.
    pub fn map_noreserve(size: usize) -> Result<MmapRegion> {
        let size = round_up(size.max(1), page_size());
        let ptr = map_anonymous(size, MAP_NORESERVE)?;
        Ok(MmapRegion { ptr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address must be a multiple of the page size (but length need
        //   not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - Everything handed out of this region borrows from it, so nothing
        //   can use it after we're dropped
        if let Err(e) = unsafe { unmap(self.ptr, self.size) } {
            log::warn!("dropping MmapRegion at {:p}: {e}", self.ptr);
        }
    }
}
