use forensics_internals::AllocError;

/// Error returned when a runtime cannot be created or installed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// [`initialize`](crate::initialize) was called while a runtime was
    /// already installed.
    AlreadyInitialized,
    /// One of the runtime's fixed buffers could not be allocated.
    AllocationFailed {
        /// The store that was being allocated.
        what: &'static str,
        /// The size of the failed request.
        bytes: usize,
    },
}

impl InitError {
    pub(crate) fn allocation(what: &'static str) -> impl FnOnce(AllocError) -> Self {
        move |error| Self::AllocationFailed {
            what,
            bytes: error.bytes,
        }
    }
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => {
                write!(f, "a forensics runtime is already installed globally")
            }
            Self::AllocationFailed { what, bytes } => {
                write!(f, "failed to allocate {bytes} bytes for the {what}")
            }
        }
    }
}

impl core::error::Error for InitError {}
