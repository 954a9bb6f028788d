//! Fixed-capacity buffer owned through a [`StorageAllocator`].
//!
//! This module encapsulates the `ptr` field of [`FixedBuf`], ensuring it is
//! only visible within this module. This visibility restriction guarantees
//! the safety invariant: **the pointer either comes from the stored
//! allocator with `Layout::array::<T>(capacity)`, or is dangling with a
//! zero-sized footprint**.
//!
//! A [`FixedBuf`] never grows. Its elements are initialized with a fill value
//! at construction time, so every slot is always readable.

use core::{alloc::Layout, ptr::NonNull};

use crate::allocator::{AllocError, SharedAllocator};

/// A heap buffer of exactly `capacity` initialized `T` values.
pub struct FixedBuf<T: Copy> {
    /// Pointer to the first element.
    ///
    /// # Safety
    ///
    /// The following safety invariants are guaranteed to be upheld as long as
    /// this struct exists:
    ///
    /// 1. If [`Self::footprint`] returns `Some(layout)`, the pointer was
    ///    returned by `self.allocator.allocate(layout)` and has not been
    ///    released.
    /// 2. Otherwise the pointer is [`NonNull::dangling`] and no memory is
    ///    owned.
    /// 3. All `capacity` elements are initialized.
    ptr: NonNull<T>,
    /// Number of elements.
    capacity: usize,
    /// Allocator the buffer is released through.
    allocator: SharedAllocator,
}

// SAFETY: `FixedBuf<T>` owns its elements exclusively, like a `Box<[T]>`.
unsafe impl<T: Copy + Send> Send for FixedBuf<T> {}
// SAFETY: shared access only hands out `&[T]`, like a `Box<[T]>`.
unsafe impl<T: Copy + Sync> Sync for FixedBuf<T> {}

impl<T: Copy> FixedBuf<T> {
    /// Allocates `capacity` elements, each set to `fill`.
    ///
    /// A zero capacity performs no allocation at all.
    pub fn new_in(capacity: usize, fill: T, allocator: &SharedAllocator) -> Result<Self, AllocError> {
        let Some(layout) = Self::layout_for(capacity)? else {
            return Ok(Self {
                ptr: NonNull::dangling(),
                capacity,
                allocator: allocator.clone(),
            });
        };

        let ptr = allocator
            .allocate(layout)
            .ok_or(AllocError {
                bytes: layout.size(),
            })?
            .cast::<T>();

        for index in 0..capacity {
            // SAFETY: `index < capacity`, so the write stays inside the block
            // of `Layout::array::<T>(capacity)` that was just allocated.
            unsafe {
                ptr.as_ptr().add(index).write(fill);
            }
        }

        Ok(Self {
            ptr,
            capacity,
            allocator: allocator.clone(),
        })
    }

    /// Creates a buffer with no elements that owns no memory.
    pub fn empty(allocator: &SharedAllocator) -> Self {
        Self {
            ptr: NonNull::dangling(),
            capacity: 0,
            allocator: allocator.clone(),
        }
    }

    /// Frees the owned memory now, leaving an empty buffer behind.
    pub fn release(&mut self) {
        if let Some(layout) = self.footprint() {
            // SAFETY:
            // 1. A footprint exists, so the pointer came from
            //    `self.allocator.allocate(layout)` (type invariant 1).
            // 2. The pointer is replaced by a dangling one with a zero capacity
            //    right below, so the block is never used or released again.
            unsafe {
                self.allocator.deallocate(self.ptr.cast::<u8>(), layout);
            }
        }
        self.ptr = NonNull::dangling();
        self.capacity = 0;
    }

    /// Returns the number of elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets every element back to `fill`.
    pub fn fill(&mut self, fill: T) {
        self.as_mut_slice().fill(fill);
    }

    /// Returns the elements as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the pointer is valid for `capacity` initialized elements,
        // or dangling and well-aligned with a zero-sized footprint (type
        // invariants 2 and 3).
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    /// Returns the elements as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as in `as_slice`, and `&mut self` guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Layout of the owned block, if any memory is owned.
    fn footprint(&self) -> Option<Layout> {
        Self::layout_for(self.capacity).ok().flatten()
    }

    /// Layout to request for `capacity` elements, or `None` when nothing needs
    /// to be allocated.
    fn layout_for(capacity: usize) -> Result<Option<Layout>, AllocError> {
        let layout = Layout::array::<T>(capacity).map_err(|_| AllocError { bytes: usize::MAX })?;
        if layout.size() == 0 {
            Ok(None)
        } else {
            Ok(Some(layout))
        }
    }
}

impl<T: Copy> core::ops::Deref for FixedBuf<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Copy> core::ops::DerefMut for FixedBuf<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Copy> core::ops::Drop for FixedBuf<T> {
    fn drop(&mut self) {
        if let Some(layout) = self.footprint() {
            // SAFETY:
            // 1. A footprint exists, so the pointer came from
            //    `self.allocator.allocate(layout)` (type invariant 1).
            // 2. We are in the drop function, so the block is released exactly
            //    once and the pointer is not used afterwards.
            unsafe {
                self.allocator.deallocate(self.ptr.cast::<u8>(), layout);
            }
        }
    }
}

impl<T: Copy + core::fmt::Debug> core::fmt::Debug for FixedBuf<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{SystemAllocator, shared_allocator};

    #[test]
    fn test_fixed_buf_send_sync() {
        static_assertions::assert_impl_all!(FixedBuf<u8>: Send, Sync);
        static_assertions::assert_not_impl_any!(FixedBuf<*const u8>: Send, Sync);
    }

    #[test]
    fn test_zero_capacity_is_empty() {
        let allocator = shared_allocator(SystemAllocator);
        let buf = FixedBuf::new_in(0, 0u64, &allocator).unwrap();
        assert_eq!(buf.capacity(), 0);
        assert!(buf.as_slice().is_empty());
        assert!(buf.footprint().is_none());
    }

    #[test]
    fn test_filled_on_creation() {
        let allocator = shared_allocator(SystemAllocator);
        let mut buf = FixedBuf::new_in(4, 7u32, &allocator).unwrap();
        assert_eq!(&buf[..], &[7, 7, 7, 7]);
        buf[2] = 1;
        assert_eq!(&buf[..], &[7, 7, 1, 7]);
        buf.fill(0);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_release_empties() {
        let allocator = shared_allocator(SystemAllocator);
        let mut buf = FixedBuf::new_in(8, 1u8, &allocator).unwrap();
        buf.release();
        assert_eq!(buf.capacity(), 0);
        assert!(buf.footprint().is_none());
        // releasing twice is harmless
        buf.release();
    }
}
