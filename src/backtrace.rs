//! Backtrace capture collaborator.
//!
//! A report carries the raw return addresses of the failing call stack. They
//! are captured into a buffer that is allocated once at init, sized by the
//! `max_backtrace_count` field of [`Config`](crate::Config).
//! Addresses are never symbolicated.
//!
//! The default collaborator is [`FrameWalker`] when the `backtrace` feature is
//! enabled, and [`NoBacktrace`] otherwise.

use core::ffi::c_void;

use triomphe::Arc;
use unsize::CoerceUnsize;

/// One return address of a captured call stack.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct FrameAddress(usize);

impl FrameAddress {
    /// The empty address, used to fill unused frames.
    pub const NULL: Self = Self(0);

    /// Wraps an instruction pointer.
    #[inline]
    pub fn new(ip: *mut c_void) -> Self {
        Self(ip as usize)
    }

    /// Returns the address as an integer.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }

    /// Returns the address as a pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl core::fmt::Debug for FrameAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl core::fmt::Display for FrameAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Captures the current call stack.
///
/// Implementations write at most `frames.len()` addresses, innermost first,
/// and return how many they wrote. Returning zero is valid.
///
/// Capture can run inside a signal handler, so implementations should avoid
/// allocating or taking locks where they can.
///
/// # Examples
///
/// ```
/// use forensics::{Config, backtrace::FrameAddress};
///
/// let config = Config::default().backtrace_capture(|frames: &mut [FrameAddress]| {
///     // report a single fake frame
///     match frames.first_mut() {
///         Some(first) => {
///             *first = FrameAddress::new(0x1000 as *mut _);
///             1
///         }
///         None => 0,
///     }
/// });
/// # drop(config);
/// ```
pub trait BacktraceCapture: 'static + Send + Sync {
    /// Fills `frames` with return addresses and returns the count written.
    fn capture(&self, frames: &mut [FrameAddress]) -> usize;
}

impl<F> BacktraceCapture for F
where
    F: Fn(&mut [FrameAddress]) -> usize + 'static + Send + Sync,
{
    fn capture(&self, frames: &mut [FrameAddress]) -> usize {
        self(frames)
    }
}

/// Shared handle to a type-erased [`BacktraceCapture`].
pub type SharedBacktrace = Arc<dyn BacktraceCapture>;

pub(crate) fn shared_backtrace<B: BacktraceCapture>(capture: B) -> SharedBacktrace {
    Arc::new(capture).unsize(unsize::Coercion!(to dyn BacktraceCapture))
}

/// Returns the collaborator used by [`Config::default`](crate::Config).
pub fn default_capture() -> SharedBacktrace {
    #[cfg(feature = "backtrace")]
    {
        shared_backtrace(FrameWalker::DEFAULT)
    }
    #[cfg(not(feature = "backtrace"))]
    {
        shared_backtrace(NoBacktrace)
    }
}

/// A collaborator that never captures anything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoBacktrace;

impl BacktraceCapture for NoBacktrace {
    fn capture(&self, _frames: &mut [FrameAddress]) -> usize {
        0
    }
}

/// Walks the stack with the [`backtrace`](::backtrace) crate.
#[cfg(feature = "backtrace")]
#[cfg_attr(docsrs, doc(cfg(feature = "backtrace")))]
#[derive(Copy, Clone, Debug)]
pub struct FrameWalker {
    /// Number of innermost frames to leave out.
    pub skip_frames: usize,
}

#[cfg(feature = "backtrace")]
impl FrameWalker {
    /// Captures every frame.
    pub const DEFAULT: Self = Self { skip_frames: 0 };
}

#[cfg(feature = "backtrace")]
impl Default for FrameWalker {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(feature = "backtrace")]
impl BacktraceCapture for FrameWalker {
    fn capture(&self, frames: &mut [FrameAddress]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let mut skipped = 0;
        let mut count = 0;
        ::backtrace::trace(|frame| {
            if skipped < self.skip_frames {
                skipped += 1;
                return true;
            }
            frames[count] = FrameAddress::new(frame.ip());
            count += 1;
            count < frames.len()
        });
        count
    }
}
