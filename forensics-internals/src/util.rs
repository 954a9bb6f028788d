//! Internal utility functions.

/// Size of the terminator byte written after every stored string.
pub(crate) const TERMINATOR_SIZE: usize = 1;

/// Reinterprets bytes that were copied verbatim out of a `&str`.
///
/// # Safety
///
/// The caller must ensure:
///
/// 1. `bytes` is exactly the byte range of a string that was copied from a
///    `&str`, starting and ending on the same boundaries.
#[inline]
pub(crate) unsafe fn stored_str(bytes: &[u8]) -> &str {
    debug_assert!(core::str::from_utf8(bytes).is_ok());
    // SAFETY: the bytes are a verbatim copy of a complete `&str` (guaranteed
    // by the caller), so they are valid UTF-8.
    unsafe { core::str::from_utf8_unchecked(bytes) }
}

/// Copies `value` into `dest` followed by a terminator byte, returning the
/// number of bytes written.
///
/// `dest` must be at least `value.len() + TERMINATOR_SIZE` bytes long.
#[inline]
pub(crate) fn write_terminated(dest: &mut [u8], value: &str) -> usize {
    let len = value.len();
    dest[..len].copy_from_slice(value.as_bytes());
    dest[len] = 0;
    len + TERMINATOR_SIZE
}
