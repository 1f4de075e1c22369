//! Block - An owned, cache-line aligned, fixed-size byte buffer.
//!
//! Blocks are the item handles that travel detector -> queue -> executor
//! -> pool. Ownership is linear: whoever holds the `Block` owns the memory,
//! and dropping it returns the memory to the general allocator.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment of every block (one cache line)
pub const CACHE_LINE: usize = 64;

/// A heap buffer of `capacity()` bytes aligned to [`CACHE_LINE`].
///
/// Contents are zeroed on first allocation; recycled blocks keep whatever
/// the previous owner wrote.
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a Block uniquely owns its allocation, like Box<[u8]>.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    #[inline]
    fn layout(size: usize) -> Option<Layout> {
        if size == 0 {
            return None;
        }
        Layout::from_size_align(size, CACHE_LINE).ok()
    }

    /// Allocate a zeroed block of `size` bytes.
    ///
    /// Returns `None` when `size` is zero, the layout overflows, or the
    /// allocator is out of memory.
    pub fn try_alloc(size: usize) -> Option<Self> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Self { ptr, size })
    }

    /// Allocate a zeroed block, aborting on out-of-memory like `Vec` does.
    ///
    /// # Panics
    /// Panics if `size` is zero or overflows a valid layout.
    pub(crate) fn alloc_or_abort(size: usize) -> Self {
        match Self::try_alloc(size) {
            Some(block) => block,
            None => match Self::layout(size) {
                Some(layout) => alloc::handle_alloc_error(layout),
                None => panic!("invalid block size {size}"),
            },
        }
    }

    /// Usable size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Give up ownership without freeing.
    #[inline]
    pub(crate) fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Re-take ownership of a pointer produced by [`Block::into_raw`].
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` on a block of exactly `size` bytes,
    /// and must not be owned by anything else.
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }
}

impl Deref for Block {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for `size` initialized bytes while we own it.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for Block {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.size) {
            // SAFETY: allocated with this exact layout in try_alloc.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}
