//! Pluggable allocation hooks for all fixed-capacity storage.
//!
//! Every buffer in the diagnostics engine is allocated exactly once, when the
//! store that owns it is created, and released when that store is dropped.
//! Both operations go through a [`StorageAllocator`], which lets embedders
//! route the engine's memory into an arena, a pre-reserved region or an
//! accounting wrapper.

use core::{alloc::Layout, ptr::NonNull};

use triomphe::Arc;
use unsize::CoerceUnsize;

/// Allocation hook pair used for every internal buffer.
///
/// Any per-allocator user data lives in the implementing type itself.
///
/// # Safety
///
/// Implementors must uphold the following:
///
/// 1. A pointer returned by [`allocate`](Self::allocate) must be valid for
///    reads and writes of `layout.size()` bytes and aligned to
///    `layout.align()`.
/// 2. The block must stay valid until it is passed to
///    [`deallocate`](Self::deallocate) with the same layout.
pub unsafe trait StorageAllocator: 'static + Send + Sync {
    /// Allocates a block for `layout`, returning `None` on exhaustion.
    ///
    /// The layout passed in always has a non-zero size.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    ///
    /// 1. `ptr` was returned by `self.allocate(layout)` with the same layout.
    /// 2. The block has not been released before.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Shared handle to a type-erased [`StorageAllocator`].
pub type SharedAllocator = Arc<dyn StorageAllocator>;

/// Wraps an allocator into a [`SharedAllocator`].
pub fn shared_allocator<A: StorageAllocator>(allocator: A) -> SharedAllocator {
    Arc::new(allocator).unsize(unsize::Coercion!(to dyn StorageAllocator))
}

/// The default allocator, backed by the global Rust allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemAllocator;

// SAFETY: `alloc::alloc::alloc` returns blocks that satisfy `layout` and stay
// valid until `alloc::alloc::dealloc` is called with the same layout.
unsafe impl StorageAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: the layout has a non-zero size, which `FixedBuf` guarantees
        // for every call it makes.
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the pointer came from `alloc::alloc::alloc` with this layout
        // (guaranteed by the caller).
        unsafe {
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Error returned when a store's backing allocation cannot be satisfied.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocError {
    /// The number of bytes that were requested.
    pub bytes: usize,
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "failed to allocate {} bytes of diagnostics storage", self.bytes)
    }
}

impl core::error::Error for AllocError {}
