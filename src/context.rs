//! The allocator proper: the four entry points on top of the page arena, the
//! node pool and the two indices.
//!
//! A block goes through
//!
//! ```plaintext
//! UNALLOCATED --allocate--> LIVE --release--> CACHED --allocate--> LIVE ...
//!                             \                  \
//!                              `--release--------`--(no recycling / evicted)--> UNALLOCATED
//! ```
//!
//! While LIVE its node sits in the [`AllocationIndex`], while CACHED in the
//! [`ReuseIndex`] with its data pages `PROT_NONE`, so touching freed memory
//! faults just like overrunning live memory does.
//!
//! There are three locks (pool, live index, cache index) and no allocator
//! path ever holds two of them at once. Only the `fork()` handlers of the
//! `interpose` build take all three, in a fixed order.

use std::ptr::{self, NonNull};

use crate::{
    arena::{ArenaStats, PageArena},
    config::Config,
    error::{Error, Result},
    index::{AllocationIndex, ReuseIndex},
    node::{BlockInfo, MetadataNode, NodePtr},
    os::mem::page_size,
    pool::NodePool,
    sync::FutexMutex,
    util::{
        assert::{aligned_to, within},
        num::checked_round_up,
    },
};

/// A point-in-time view of the allocator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub arena: ArenaStats,
    pub live: usize,
    pub cached: usize,
    pub pool_in_use: usize,
    pub pool_capacity: usize,
    /// Address space reserved for the node pool
    pub pool_bytes: usize,
}

/// Node counts confirmed by [`Context::verify()`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub live: usize,
    pub cached: usize,
}

/// A mapping handed out by `obtain()`, not yet in any index
struct Obtained {
    node: NodePtr,
    data_pages: usize,
    recycled: bool,
}

pub struct Context {
    config: Config,
    arena: PageArena,
    pool_capacity: usize,
    pool: FutexMutex<NodePool<MetadataNode>>,
    live: FutexMutex<AllocationIndex>,
    cache: FutexMutex<ReuseIndex>,
}

impl Context {
    /// Build an allocator with its own node pool. Maps the pool region, but
    /// no user pages.
    pub fn new(config: Config) -> Result<Self> {
        let pool = NodePool::new(config.pool_order)?;
        Ok(Self {
            config,
            arena: PageArena::new(page_size()),
            pool_capacity: pool.capacity(),
            pool: FutexMutex::new(pool),
            live: FutexMutex::new(AllocationIndex::new()),
            cache: FutexMutex::new(ReuseIndex::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.arena.page_size()
    }

    /// Allocate `size` bytes, ending right at a guard page. `Ok(None)` for
    /// `size == 0`.
    pub fn allocate(&self, size: usize) -> Result<Option<NonNull<u8>>> {
        Ok(self.place(size, 1, None)?.map(|(ptr, _)| ptr))
    }

    /// [`Context::allocate()`], with a label that shows up in [`BlockInfo`]
    pub fn allocate_tagged(&self, size: usize, tag: &'static str) -> Result<Option<NonNull<u8>>> {
        Ok(self.place(size, 1, Some(tag))?.map(|(ptr, _)| ptr))
    }

    /// [`Context::allocate()`] for alignments above the configured one, up to
    /// the page size.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<Option<NonNull<u8>>> {
        Ok(self.place(size, align, None)?.map(|(ptr, _)| ptr))
    }

    /// Allocate `count * size` zeroed bytes
    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<Option<NonNull<u8>>> {
        let total = count.checked_mul(size).ok_or(Error::SizeOverflow)?;
        self.zero_allocate_aligned(total, 1)
    }

    pub fn zero_allocate_aligned(&self, size: usize, align: usize) -> Result<Option<NonNull<u8>>> {
        let Some((ptr, recycled)) = self.place(size, align, None)? else {
            return Ok(None);
        };
        // Fresh mappings come zeroed from the kernel, cached ones still hold
        // whatever their last owner left there
        if recycled {
            // SAFETY: `ptr` is a live block of at least `size` bytes
            unsafe { ptr.as_ptr().write_bytes(0, size) };
        }
        Ok(Some(ptr))
    }

    /// Hand a block back. Null is ignored, anything else must be a live
    /// block of this allocator, or we report [`Error::InvalidRelease`].
    pub fn release(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let node = self
            .live
            .lock()
            .find_and_remove(ptr as usize)
            .ok_or(Error::InvalidRelease { ptr: ptr as usize })?;
        self.retire(node)
    }

    /// Move a block to a fresh one of `new_size` bytes, keeping the first
    /// `min(old size, new_size)` bytes.
    ///
    /// - A null `ptr` is plain [`Context::allocate()`]
    /// - A `ptr` we don't know gives `Ok(None)` and changes nothing
    /// - `new_size == 0` releases `ptr` and gives `Ok(None)`
    pub fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
        self.resize_aligned(ptr, new_size, 1)
    }

    pub fn resize_aligned(
        &self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
    ) -> Result<Option<NonNull<u8>>> {
        if ptr.is_null() {
            return self.allocate_aligned(new_size, align);
        }
        let Some(old) = self.block(ptr) else {
            return Ok(None);
        };
        if new_size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }
        let Some((new, _)) = self.place(new_size, align, old.tag)? else {
            return Ok(None);
        };
        // SAFETY: both blocks are live and distinct, and both hold at least
        // the bytes we copy
        unsafe { ptr::copy_nonoverlapping(ptr, new.as_ptr(), old.user_size.min(new_size)) };
        self.release(ptr)?;
        Ok(Some(new))
    }

    /// [`Context::resize()`] to `count * size` bytes
    pub fn resize_array(&self, ptr: *mut u8, count: usize, size: usize) -> Result<Option<NonNull<u8>>> {
        let total = count.checked_mul(size).ok_or(Error::SizeOverflow)?;
        self.resize(ptr, total)
    }

    /// The record of the live block at `ptr`
    pub fn block(&self, ptr: *const u8) -> Option<BlockInfo> {
        self.live.lock().find(ptr as usize).map(MetadataNode::info)
    }

    /// The size originally requested for the live block at `ptr`
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        self.block(ptr).map(|b| b.user_size)
    }

    /// Unmap every cached mapping. Returns how many there were.
    pub fn purge_cache(&self) -> Result<usize> {
        let mut purged = 0;
        loop {
            let Some(node) = self.cache.lock().pop_first() else {
                break;
            };
            self.destroy(node)?;
            purged += 1;
        }
        log::debug!("purged {purged} cached mappings");
        Ok(purged)
    }

    pub fn stats(&self) -> Stats {
        let live = self.live.lock().len();
        let cached = self.cache.lock().len();
        let (pool_in_use, pool_bytes) = {
            let pool = self.pool.lock();
            (pool.in_use(), pool.mapped_bytes())
        };
        Stats {
            arena: self.arena.stats(),
            live,
            cached,
            pool_in_use,
            pool_capacity: self.pool_capacity,
            pool_bytes,
        }
    }

    /// Check both indices and every live record, and that every node taken
    /// from the pool is in exactly one index. Only meaningful while no other
    /// thread is using this allocator.
    pub fn verify(&self) -> Result<Census> {
        let page_size = self.page_size();
        let live = {
            let live = self.live.lock();
            let count = live.verify()?;
            let mut bad = false;
            live.for_each(|n| {
                let data_end = n.guard_page(page_size);
                bad |= n.page_count < 2
                    || !aligned_to(n.pages_base, page_size)
                    || !within(n.user_ptr, n.user_size, n.pages_base, data_end)
                    || !aligned_to(n.user_ptr, self.config.alignment);
            });
            if bad {
                return Err(Error::Corrupt("live record outside its mapping"));
            }
            count
        };
        let cached = self.cache.lock().verify()?;
        if self.pool.lock().in_use() != live + cached {
            return Err(Error::Corrupt("metadata nodes in no index"));
        }
        Ok(Census { live, cached })
    }

    /// Visit every live block in address order. `f` runs under the index
    /// lock and must not call back into this allocator.
    pub fn for_each_live(&self, mut f: impl FnMut(BlockInfo)) {
        self.live.lock().for_each(|n| f(n.info()))
    }

    fn place(
        &self,
        size: usize,
        align: usize,
        tag: Option<&'static str>,
    ) -> Result<Option<(NonNull<u8>, bool)>> {
        if size == 0 {
            return Ok(None);
        }
        self.check_alignment(align)?;
        let align = align.max(self.config.alignment);
        self.check_alignment(align)?;
        let rounded = checked_round_up(size, align).ok_or(Error::SizeOverflow)?;
        let data_pages = rounded.div_ceil(self.page_size());
        let Obtained {
            node,
            data_pages,
            recycled,
        } = self.obtain(data_pages)?;

        // SAFETY: `obtain()` gives us a node no index knows about
        let user_ptr = unsafe {
            let n = &mut *node.as_ptr();
            n.user_ptr = n.pages_base + data_pages * self.page_size() - rounded;
            n.user_size = size;
            n.tag = tag;
            n.user_ptr
        };
        // SAFETY: initialized, in no index, lives in our pool
        let inserted = unsafe { self.live.lock().insert(node) };
        if let Err(e) = inserted {
            self.destroy(node)?;
            return Err(e);
        }
        // `user_ptr` is inside a mapping, so never null
        Ok(NonNull::new(user_ptr as *mut u8).map(|ptr| (ptr, recycled)))
    }

    /// Alignments must be powers of two no larger than a page
    fn check_alignment(&self, align: usize) -> Result<()> {
        if !align.is_power_of_two() || align > self.page_size() {
            return Err(Error::BadAlignment { align });
        }
        Ok(())
    }

    /// A mapping with `data_pages` usable pages: a cached one if we have it,
    /// else a fresh one.
    fn obtain(&self, data_pages: usize) -> Result<Obtained> {
        let page_count = data_pages.checked_add(1).ok_or(Error::SizeOverflow)?;
        if self.config.recycle {
            let cached = self.cache.lock().take(page_count);
            if let Some(node) = cached {
                // SAFETY: cached nodes describe mappings we still own
                if let Err(e) = unsafe { self.arena.unguard(node.as_ref()) } {
                    self.destroy(node)?;
                    return Err(e);
                }
                return Ok(Obtained {
                    node,
                    data_pages,
                    recycled: true,
                });
            }
        }

        let node = self.pool.lock().acquire().ok_or(Error::PoolExhausted {
            capacity: self.pool_capacity,
        })?;
        let base = match self.arena.allocate(data_pages) {
            Ok(base) => base,
            Err(e) => {
                self.pool.lock().release(node)?;
                return Err(e);
            }
        };
        // SAFETY: fresh pool slot, ours to initialize
        unsafe { node.as_ptr().write(MetadataNode::new(base.as_ptr() as usize, page_count)) };
        Ok(Obtained {
            node,
            data_pages,
            recycled: false,
        })
    }

    /// Take a node that just left the live index out of service: cache it
    /// behind `PROT_NONE`, or unmap it.
    fn retire(&self, node: NodePtr) -> Result<()> {
        if !self.config.recycle {
            return self.destroy(node);
        }
        // SAFETY: the block was just removed from the live index, so the
        // caller has given up its pointer into it
        if let Err(e) = unsafe { self.arena.guard(node.as_ref()) } {
            self.destroy(node)?;
            return Err(e);
        }
        // SAFETY: the node is in no index and lives in our pool
        let displaced = unsafe { self.cache.lock().insert(node) };
        match displaced {
            Some(old) => self.destroy(old),
            None => Ok(()),
        }
    }

    /// Unmap a node's pages and return the node to the pool
    fn destroy(&self, node: NodePtr) -> Result<()> {
        // SAFETY: the node is in no index, so nobody can reach its mapping
        unsafe { self.arena.release(node.as_ref()) };
        self.pool.lock().release(node)
    }

    /// Take all three locks and keep them past this call, so a `fork()`
    /// can't snapshot any of them mid-update. The only place two are held at
    /// once, always in this order.
    #[cfg(feature = "interpose")]
    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.pool.lock());
        std::mem::forget(self.live.lock());
        std::mem::forget(self.cache.lock());
    }

    /// # Safety
    ///
    /// Must follow [`Context::lock_for_fork()`] on this thread (or in the
    /// child, which only has this thread).
    #[cfg(feature = "interpose")]
    pub(crate) unsafe fn unlock_after_fork(&self) {
        unsafe {
            self.cache.force_unlock();
            self.live.force_unlock();
            self.pool.force_unlock();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let arena = &self.arena;
        let mut unmapped = 0;
        // SAFETY (both closures): dropping the allocator ends every block it
        // handed out
        self.live.get_mut().drain(|node| {
            unsafe { arena.release(node.as_ref()) };
            unmapped += 1;
        });
        self.cache.get_mut().drain(|node| {
            unsafe { arena.release(node.as_ref()) };
            unmapped += 1;
        });
        self.pool.get_mut().reset();
        log::debug!("allocator dropped, unmapped {unmapped} blocks");
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use super::*;

    fn context(recycle: bool) -> Context {
        Context::new(Config::default().pool_order(10).recycle(recycle)).unwrap()
    }

    unsafe fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    #[test]
    fn zero_size_is_null_and_free() {
        let ctx = context(true);
        assert_eq!(ctx.allocate(0), Ok(None));
        assert_eq!(ctx.stats().arena.maps, 0);
        assert_eq!(ctx.release(ptr::null_mut()), Ok(()));
        assert_eq!(ctx.verify(), Ok(Census { live: 0, cached: 0 }));
    }

    #[test]
    fn block_ends_against_the_guard_page() {
        let ctx = context(true);
        let ps = ctx.page_size();
        for size in [1, 3, 4, 5, 100, ps - 1, ps, ps + 1, 3 * ps + 17] {
            let ptr = ctx.allocate(size).unwrap().unwrap();
            let block = ctx.block(ptr.as_ptr()).unwrap();
            let rounded = (size + 3) & !3;
            assert_eq!(block.user_size, size);
            assert_eq!(block.page_count, rounded.div_ceil(ps) + 1);
            assert_eq!(block.user_ptr + rounded, block.pages_base + (block.page_count - 1) * ps);
            assert!(aligned_to(block.user_ptr, 4));
            // SAFETY: the whole block is ours
            unsafe { bytes(ptr, size).fill(0xcd) };
            ctx.release(ptr.as_ptr()).unwrap();
        }
        ctx.verify().unwrap();
    }

    #[test]
    fn alignment_setting_controls_slack() {
        let ctx = Context::new(Config::default().pool_order(6).alignment(1)).unwrap();
        let ptr = ctx.allocate(13).unwrap().unwrap();
        let block = ctx.block(ptr.as_ptr()).unwrap();
        assert_eq!(block.user_ptr + 13, block.pages_base + ctx.page_size());

        let ptr = ctx.allocate_aligned(13, 64).unwrap().unwrap();
        assert!(aligned_to(ptr.as_ptr() as usize, 64));
        assert_eq!(
            ctx.allocate_aligned(13, 3 * ctx.page_size()),
            Err(Error::BadAlignment { align: 3 * ctx.page_size() })
        );
    }

    #[test]
    fn caller_alignment_is_checked_before_the_minimum() {
        let ctx = context(true);
        for align in [3, 6, 12] {
            assert_eq!(ctx.allocate_aligned(13, align), Err(Error::BadAlignment { align }));
        }
        assert_eq!(ctx.resize_aligned(ptr::null_mut(), 13, 3), Err(Error::BadAlignment { align: 3 }));
        assert_eq!(ctx.zero_allocate_aligned(13, 5), Err(Error::BadAlignment { align: 5 }));
        // Below the configured minimum is fine, the minimum wins
        let ptr = ctx.allocate_aligned(13, 2).unwrap().unwrap();
        assert!(aligned_to(ptr.as_ptr() as usize, 4));
        assert_eq!(ctx.stats().live, 1);
    }

    #[test]
    fn double_release_is_reported() {
        for recycle in [true, false] {
            let ctx = context(recycle);
            let ptr = ctx.allocate(64).unwrap().unwrap().as_ptr();
            ctx.release(ptr).unwrap();
            assert_eq!(ctx.release(ptr), Err(Error::InvalidRelease { ptr: ptr as usize }));
            let mut local = 0u8;
            assert!(matches!(ctx.release(&mut local), Err(Error::InvalidRelease { .. })));
            ctx.verify().unwrap();
        }
    }

    #[test]
    fn recycling_reuses_the_mapping_without_syscalls() {
        let ctx = context(true);
        let a = ctx.allocate(5000).unwrap().unwrap();
        let first = ctx.block(a.as_ptr()).unwrap();
        ctx.release(a.as_ptr()).unwrap();
        assert_eq!(ctx.stats().cached, 1);

        // Same page count, different size
        let b = ctx.allocate(6000).unwrap().unwrap();
        let second = ctx.block(b.as_ptr()).unwrap();
        assert_eq!(second.pages_base, first.pages_base);
        let stats = ctx.stats();
        assert_eq!((stats.arena.maps, stats.arena.unmaps), (1, 0));
        assert_eq!((stats.live, stats.cached, stats.pool_in_use), (1, 0, 1));
        assert!(stats.pool_bytes >= stats.pool_capacity * std::mem::size_of::<MetadataNode>());
        ctx.verify().unwrap();
    }

    #[test]
    fn without_recycling_every_call_is_a_syscall() {
        let ctx = context(false);
        for i in 1..=10 {
            let p = ctx.allocate(i * 1000).unwrap().unwrap();
            ctx.release(p.as_ptr()).unwrap();
        }
        let stats = ctx.stats();
        assert_eq!((stats.arena.maps, stats.arena.unmaps), (10, 10));
        assert_eq!((stats.live, stats.cached, stats.pool_in_use), (0, 0, 0));
    }

    #[test]
    fn cache_keeps_one_mapping_per_page_count() {
        let ctx = context(true);
        let a = ctx.allocate(10).unwrap().unwrap();
        let b = ctx.allocate(20).unwrap().unwrap();
        ctx.release(a.as_ptr()).unwrap();
        ctx.release(b.as_ptr()).unwrap();
        let stats = ctx.stats();
        assert_eq!((stats.cached, stats.arena.unmaps, stats.pool_in_use), (1, 1, 1));
        assert_eq!(ctx.purge_cache(), Ok(1));
        assert_eq!(ctx.stats().arena.unmaps, 2);
        ctx.verify().unwrap();
    }

    #[test]
    fn resize_preserves_leading_bytes() {
        let ctx = context(true);
        let old = ctx.allocate_tagged(300, "resize").unwrap().unwrap();
        unsafe {
            for (i, b) in bytes(old, 300).iter_mut().enumerate() {
                *b = i as u8;
            }
        }
        let grown = ctx.resize(old.as_ptr(), 9000).unwrap().unwrap();
        assert!(ctx.block(old.as_ptr()).is_none());
        let block = ctx.block(grown.as_ptr()).unwrap();
        assert_eq!((block.user_size, block.tag), (9000, Some("resize")));
        unsafe {
            assert!(bytes(grown, 300).iter().enumerate().all(|(i, b)| *b == i as u8));
        }

        let shrunk = ctx.resize(grown.as_ptr(), 10).unwrap().unwrap();
        unsafe { assert_eq!(bytes(shrunk, 10).to_vec(), (0..10).collect::<Vec<u8>>()) };
        assert_eq!(ctx.stats().live, 1);
        ctx.verify().unwrap();
    }

    #[test]
    fn resize_edge_cases() {
        let ctx = context(true);
        let p = ctx.resize(ptr::null_mut(), 42).unwrap().unwrap();
        assert_eq!(ctx.usable_size(p.as_ptr()), Some(42));

        let mut local = 0u8;
        assert_eq!(ctx.resize(&mut local, 100), Ok(None));
        assert_eq!(ctx.stats().live, 1);

        assert_eq!(ctx.resize(p.as_ptr(), 0), Ok(None));
        assert_eq!(ctx.stats().live, 0);
        assert_eq!(ctx.resize_array(ptr::null_mut(), usize::MAX, 2), Err(Error::SizeOverflow));
    }

    #[test]
    fn zero_allocate_zeroes_recycled_pages() {
        let ctx = context(true);
        let p = ctx.allocate(4000).unwrap().unwrap();
        unsafe { bytes(p, 4000).fill(0xff) };
        ctx.release(p.as_ptr()).unwrap();

        let z = ctx.zero_allocate(1000, 4).unwrap().unwrap();
        assert_eq!(z, p);
        unsafe { assert!(bytes(z, 4000).iter().all(|b| *b == 0)) };

        assert_eq!(ctx.zero_allocate(usize::MAX, 3), Err(Error::SizeOverflow));
        assert_eq!(ctx.zero_allocate(0, 3), Ok(None));
    }

    #[test]
    fn pool_exhaustion_is_an_error() {
        let ctx = Context::new(Config::default().pool_order(5)).unwrap();
        let blocks: Vec<_> = (0..32).map(|_| ctx.allocate(8).unwrap().unwrap()).collect();
        assert_eq!(ctx.allocate(8), Err(Error::PoolExhausted { capacity: 32 }));
        ctx.release(blocks[0].as_ptr()).unwrap();
        // The freed node is cached, and a same-sized request reuses it
        assert!(ctx.allocate(8).unwrap().is_some());
        assert_eq!(ctx.verify(), Ok(Census { live: 32, cached: 0 }));
    }

    #[test]
    fn for_each_live_walks_in_address_order() {
        let ctx = context(false);
        let mut ptrs: Vec<usize> = (1..20)
            .map(|i| ctx.allocate(i * 100).unwrap().unwrap().as_ptr() as usize)
            .collect();
        ptrs.sort_unstable();
        let mut seen = Vec::new();
        ctx.for_each_live(|b| seen.push(b.user_ptr));
        assert_eq!(seen, ptrs);
    }

    #[test]
    fn failed_live_insert_gives_the_mapping_back() {
        let ctx = context(true);
        let p = ctx.allocate(10).unwrap().unwrap();
        ctx.release(p.as_ptr()).unwrap();

        // A stray record already sits at the pointer the cached mapping is
        // about to be handed out at
        let stray = ctx.pool.lock().acquire().unwrap();
        unsafe {
            let mut meta = MetadataNode::new(0, 2);
            meta.user_ptr = p.as_ptr() as usize;
            stray.as_ptr().write(meta);
            ctx.live.lock().insert(stray).unwrap();
        }
        assert_eq!(
            ctx.allocate(10),
            Err(Error::Corrupt("two live blocks share a user pointer"))
        );
        assert!(ctx.live.try_lock().is_some());
        assert!(ctx.pool.try_lock().is_some());
        let stats = ctx.stats();
        assert_eq!((stats.live, stats.cached, stats.pool_in_use), (1, 0, 1));
        assert_eq!((stats.arena.maps, stats.arena.unmaps), (1, 1));

        let stray = ctx.live.lock().find_and_remove(p.as_ptr() as usize).unwrap();
        ctx.pool.lock().release(stray).unwrap();
        assert_eq!(ctx.verify(), Ok(Census { live: 0, cached: 0 }));
    }
}
