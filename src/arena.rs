//! Page mappings backing user blocks, each followed by a guard page.

use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;

use crate::{
    error::{Error, Result},
    node::MetadataNode,
    os::mem::{self, Protection},
};

/// Syscall counts of one [`PageArena`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub maps: usize,
    pub unmaps: usize,
    pub protects: usize,
}

/// Maps, unmaps and (un)guards page ranges, counting every syscall it makes.
/// Stateless apart from the counters, so it needs no lock.
pub struct PageArena {
    page_size: usize,
    maps: CachePadded<AtomicUsize>,
    unmaps: CachePadded<AtomicUsize>,
    protects: CachePadded<AtomicUsize>,
}

impl PageArena {
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            maps: CachePadded::new(AtomicUsize::new(0)),
            unmaps: CachePadded::new(AtomicUsize::new(0)),
            protects: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Map `data_pages` read/write pages plus one trailing `PROT_NONE` guard
    /// page. Returns the base of the mapping.
    pub fn allocate(&self, data_pages: usize) -> Result<NonNull<u8>> {
        let total = data_pages.checked_add(1).ok_or(Error::SizeOverflow)?;
        let len = total.checked_mul(self.page_size).ok_or(Error::SizeOverflow)?;
        self.maps.fetch_add(1, Ordering::Relaxed);
        let base = mem::map_anonymous(len, 0)?;

        // SAFETY: `data_pages * page_size` is strictly inside the fresh
        // mapping of `len` bytes
        let guard = unsafe { NonNull::new_unchecked(base.as_ptr().add(data_pages * self.page_size)) };
        self.protects.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the guard page is ours and nobody has seen it yet
        if let Err(e) = unsafe { mem::protect(guard, self.page_size, Protection::None) } {
            // An unguarded block is worse than no block
            self.unmaps.fetch_add(1, Ordering::Relaxed);
            // SAFETY: nobody has seen this mapping yet
            _ = unsafe { mem::unmap(base, len) };
            return Err(e);
        }
        Ok(base)
    }

    /// Unmap the whole of `node`'s mapping, guard page included. A failure
    /// is logged and otherwise ignored, the range is lost to us either way.
    ///
    /// # Safety
    ///
    /// Nothing may touch the mapping afterwards.
    pub unsafe fn release(&self, node: &MetadataNode) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        let Some(base) = NonNull::new(node.pages_base as *mut u8) else {
            return;
        };
        // SAFETY: contract passed to the caller
        if let Err(e) = unsafe { mem::unmap(base, node.page_count * self.page_size) } {
            log::warn!("leaking {} pages at {:#x}: {e}", node.page_count, node.pages_base);
        }
    }

    /// Revoke all access to the data pages of `node`, turning any later
    /// touch into a fault.
    ///
    /// # Safety
    ///
    /// Nobody may hold references into the data pages.
    pub unsafe fn guard(&self, node: &MetadataNode) -> Result<()> {
        unsafe { self.protect_data(node, Protection::None) }
    }

    /// Make the data pages of a cached `node` usable again.
    ///
    /// # Safety
    ///
    /// `node` must describe a live mapping of ours.
    pub unsafe fn unguard(&self, node: &MetadataNode) -> Result<()> {
        unsafe { self.protect_data(node, Protection::ReadWrite) }
    }

    unsafe fn protect_data(&self, node: &MetadataNode, prot: Protection) -> Result<()> {
        let data_pages = node.page_count - 1;
        let Some(base) = NonNull::new(node.pages_base as *mut u8) else {
            return Err(Error::ProtectFailed { addr: 0, errno: 0 });
        };
        self.protects.fetch_add(1, Ordering::Relaxed);
        // SAFETY: contract passed to the caller; the guard page itself is
        // left alone, it stays PROT_NONE for the life of the mapping
        unsafe { mem::protect(base, data_pages * self.page_size, prot) }
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            protects: self.protects.load(Ordering::Relaxed),
        }
    }
}
