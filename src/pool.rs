//! A fixed-capacity slab for allocator bookkeeping.
//!
//! We can't ask the general allocator for metadata (we *are* the general
//! allocator), so every metadata record lives in one big `mmap()`ed region,
//! laid out as
//!
//! ```plaintext
//! +---------------------------+
//! | occupancy bitmap          | capacity / 32 words, bit set = slot in use
//! +---------------------------+
//! | padding to align_of::<T>  |
//! +---------------------------+
//! | element array             | capacity * size_of::<T>() bytes
//! +---------------------------+
//! ```
//!
//! The region is mapped without reservation, so the unused tail of a large
//! pool costs address space only. There is no growth: once every bit is set,
//! `acquire()` fails.

use std::{
    marker::PhantomData,
    mem::{align_of, size_of},
    ptr::NonNull,
};

use crate::{
    error::{Error, Result},
    os::mem::MmapRegion,
    util::{assert::aligned_to, num::round_up},
};

type Word = u32;

const WORD_BITS: usize = Word::BITS as usize;

/// Smallest accepted capacity order, one bitmap word
pub const MIN_ORDER: u32 = 5;

/// Largest accepted capacity order
pub const MAX_ORDER: u32 = 28;

pub struct NodePool<T> {
    region: MmapRegion,
    bits: NonNull<Word>,
    words: usize,
    elements: NonNull<T>,
    capacity: usize,
    in_use: usize,
    /// Every word below this index is full. Only ever moves down on
    /// `release()`, and up while scanning in `acquire()`.
    first_free_word: usize,
    _marker: PhantomData<T>,
}

// SAFETY: the pool owns its region outright; handing it to another thread
// hands over the slots (and the `T`s the caller put in them).
unsafe impl<T: Send> Send for NodePool<T> {}

impl<T> NodePool<T> {
    /// Map a pool of `2^order` slots. `order` is clamped to
    /// `[MIN_ORDER, MAX_ORDER]`.
    pub fn new(order: u32) -> Result<Self> {
        debug_assert!(size_of::<T>() > 0);
        let order = order.clamp(MIN_ORDER, MAX_ORDER);
        let capacity = 1usize << order;
        let words = capacity / WORD_BITS;
        let elements_offset = round_up(words * size_of::<Word>(), align_of::<T>());
        let region = MmapRegion::map_noreserve(elements_offset + capacity * size_of::<T>())?;

        let base = region.as_ptr();
        // SAFETY: both offsets are inside the region we just sized for them,
        // and the mapping is page aligned so both are suitably aligned
        let (bits, elements) = unsafe {
            (
                NonNull::new_unchecked(base as *mut Word),
                NonNull::new_unchecked(base.add(elements_offset) as *mut T),
            )
        };
        // mmap() hands out zeroed pages, so the bitmap starts all-free
        Ok(Self {
            region,
            bits,
            words,
            elements,
            capacity,
            in_use: 0,
            first_free_word: 0,
            _marker: PhantomData,
        })
    }

    fn bitmap(&self) -> &[Word] {
        // SAFETY: `bits` points at `words` initialized words inside `region`
        unsafe { std::slice::from_raw_parts(self.bits.as_ptr(), self.words) }
    }

    fn bitmap_mut(&mut self) -> &mut [Word] {
        // SAFETY: as above, and `&mut self` makes this the only view
        unsafe { std::slice::from_raw_parts_mut(self.bits.as_ptr(), self.words) }
    }

    /// Claim the lowest free slot. The returned memory is uninitialized, the
    /// caller must `write()` a `T` before reading it.
    pub fn acquire(&mut self) -> Option<NonNull<T>> {
        let start = self.first_free_word;
        let (word_index, word) = self.bitmap()[start..]
            .iter()
            .enumerate()
            .find(|(_, word)| **word != Word::MAX)
            .map(|(i, word)| (start + i, *word))?;
        let bit = word.trailing_ones() as usize;
        self.bitmap_mut()[word_index] |= 1 << bit;
        self.in_use += 1;
        self.first_free_word = word_index;

        let index = word_index * WORD_BITS + bit;
        // SAFETY: `index < capacity`, so this stays inside the element array
        Some(unsafe { NonNull::new_unchecked(self.elements.as_ptr().add(index)) })
    }

    /// Give a slot back. `element` must be an address `acquire()` returned
    /// and that hasn't been released since.
    ///
    /// The `T` in the slot is not dropped, the pool only tracks occupancy.
    pub fn release(&mut self, element: NonNull<T>) -> Result<()> {
        let index = self.index_of(element).ok_or(Error::ForeignNode {
            addr: element.as_ptr() as usize,
        })?;
        let (word_index, bit) = (index / WORD_BITS, index % WORD_BITS);
        let word = &mut self.bitmap_mut()[word_index];
        if *word & (1 << bit) == 0 {
            return Err(Error::ForeignNode {
                addr: element.as_ptr() as usize,
            });
        }
        *word &= !(1 << bit);
        self.in_use -= 1;
        self.first_free_word = self.first_free_word.min(word_index);
        Ok(())
    }

    /// Slot index of `element`, if it points exactly at one of our slots
    fn index_of(&self, element: NonNull<T>) -> Option<usize> {
        let addr = element.as_ptr() as usize;
        let start = self.elements.as_ptr() as usize;
        let end = start + self.capacity * size_of::<T>();
        if addr < start || addr >= end {
            return None;
        }
        let offset = addr - start;
        aligned_to(offset, size_of::<T>()).then_some(offset / size_of::<T>())
    }

    /// Test whether `element` is a slot of this pool that is currently taken
    #[cfg(test)]
    fn is_occupied(&self, element: NonNull<T>) -> bool {
        self.index_of(element).is_some_and(|index| {
            self.bitmap()[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
        })
    }

    /// Mark every slot free again. Whatever was in the slots is forgotten, so
    /// this is only for full teardown.
    pub fn reset(&mut self) {
        self.bitmap_mut().fill(0);
        self.in_use = 0;
        self.first_free_word = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes of address space backing this pool
    pub fn mapped_bytes(&self) -> usize {
        self.region.size()
    }
}
