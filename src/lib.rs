#![deny(
    missing_docs,
    clippy::missing_safety_doc,
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::as_ptr_cast_mut,
    clippy::ptr_as_ptr,
    rustdoc::invalid_rust_codeblocks,
    rustdoc::broken_intra_doc_links,
    unused_doc_comments
)]
// Make docs.rs generate better docs
#![cfg_attr(docsrs, feature(doc_cfg))]

//! An embeddable failure-diagnostics engine.
//!
//! ## Overview
//!
//! When an assertion fails, this crate assembles a rich report of the
//! program's state at that moment and hands it to a handler you provide. The
//! report carries:
//!
//! - the failing expression, a formatted message and the call site,
//! - the failing thread's stack of **contexts**, named scopes it is inside,
//! - the process-wide **attributes**, key/value pairs describing the process
//!   (build number, current user and so on),
//! - the **breadcrumbs**, a bounded trail of recent events, with consecutive
//!   repeats collapsed into one entry with a count,
//! - a backtrace,
//! - an **aggregation id** derived only from the context, file, function and
//!   message format, so that reports raised by the same assertion group
//!   together.
//!
//! Every buffer is allocated once, when the runtime is created, and never
//! grows. Nothing on the failure path allocates, which keeps it usable from
//! a signal handler (see the `signals` feature).
//!
//! ## Quick Example
//!
//! ```
//! use forensics::{Config, Report, forensics_context, forensics_verify};
//!
//! forensics::initialize(Config::default().report_handler(|report: &Report<'_>| {
//!     eprintln!("{report}");
//! }))?;
//!
//! forensics::set_attribute("build", Some("1234"));
//! forensics::add_breadcrumb("request", &[("path", "/index.html")]);
//! {
//!     forensics_context!("serve request");
//!     let cache_hits = 0;
//!     forensics_verify!(cache_hits > 0, "cold cache: {} hits", cache_hits);
//! }
//!
//! forensics::shutdown();
//! # Ok::<(), forensics::InitError>(())
//! ```
//!
//! ## Process-wide and explicit runtimes
//!
//! [`initialize`] installs one [`Forensics`] runtime for the whole process,
//! which the free functions and the macros use. Failures raised while no
//! runtime is installed are still printed by [`DefaultReportHandler`], with
//! empty sections.
//!
//! A [`Forensics`] value can also be created and used directly, which is
//! what the `in <runtime>;` form of the macros is for.
//!
//! ## Feature flags
//!
//! - `backtrace` (default): captures backtraces with the `backtrace` crate.
//! - `signals`: on unix, reports `SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL` and
//!   `SIGSEGV` as fatal failures.
//!
//! ## Internal diagnostics
//!
//! The engine logs its own lifecycle and degraded operations through
//! [`tracing`]. No event is emitted on the failure path itself.

#[macro_use]
mod macros;

pub mod backtrace;
pub mod config;
mod context;
mod dispatch;
mod error;
pub mod handler;
mod lock;
pub mod report;
mod runtime;
#[cfg(all(feature = "signals", unix))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "signals", unix))))]
pub mod signals;

use core::fmt;

pub use forensics_internals::{
    AllocError, BreadcrumbRef, SharedAllocator, StorageAllocator, SystemAllocator,
    shared_allocator,
};
use triomphe::Arc;

#[cfg(feature = "backtrace")]
pub use self::backtrace::FrameWalker;
pub use self::{
    backtrace::{BacktraceCapture, FrameAddress, NoBacktrace, SharedBacktrace},
    config::Config,
    error::InitError,
    handler::{DefaultReportHandler, ReportHandler, SharedHandler},
    report::{Attributes, BreadcrumbSnapshot, Breadcrumbs, CallSite, Report, ReportSnapshot},
    runtime::{ContextGuard, Forensics},
};
use self::{dispatch::Failure, lock::RuntimeLock};

static RUNTIME: RuntimeLock = RuntimeLock::new();

/// Creates the process-wide runtime.
///
/// Allocates every buffer described by `config` and, with the `signals`
/// feature, registers the signal bridge if the config asks for it.
///
/// # Errors
///
/// - [`InitError::AlreadyInitialized`] if a runtime is installed and
///   [`shutdown`] was not called since.
/// - [`InitError::AllocationFailed`] if a buffer could not be allocated.
pub fn initialize(config: Config) -> Result<(), InitError> {
    if RUNTIME.get().is_some() {
        return Err(InitError::AlreadyInitialized);
    }
    #[cfg(all(feature = "signals", unix))]
    let install_signal_handlers = config.install_signal_handlers;

    let runtime = Forensics::new(config)?;
    RUNTIME
        .install(Arc::new(runtime))
        .map_err(|_| InitError::AlreadyInitialized)?;

    #[cfg(all(feature = "signals", unix))]
    if install_signal_handlers {
        signals::register_handlers();
    }
    Ok(())
}

/// Uninstalls the process-wide runtime, releasing all of its memory.
///
/// Also restores the default signal dispositions. Does nothing if no runtime
/// is installed.
pub fn shutdown() {
    #[cfg(all(feature = "signals", unix))]
    signals::unregister_handlers();

    drop(RUNTIME.take());
}

/// Returns whether a runtime is installed.
pub fn is_initialized() -> bool {
    RUNTIME.get().is_some()
}

/// Pushes a context onto the calling thread's stack.
///
/// See [`Forensics::begin_context`].
pub fn begin_context(name: &'static str) {
    if let Some(runtime) = RUNTIME.get() {
        runtime.begin_context(name);
    }
}

/// Pops the calling thread's newest context.
///
/// See [`Forensics::end_context`].
pub fn end_context() {
    if let Some(runtime) = RUNTIME.get() {
        runtime.end_context();
    }
}

/// Pushes a context that is popped when the returned guard drops.
#[must_use = "the context ends as soon as the guard is dropped"]
pub fn context(name: &'static str) -> GlobalContextGuard {
    begin_context(name);
    GlobalContextGuard {
        _not_send: core::marker::PhantomData,
    }
}

/// Ends a context of the process-wide runtime when dropped.
///
/// Returned by [`context`].
#[must_use = "the context ends as soon as the guard is dropped"]
pub struct GlobalContextGuard {
    _not_send: core::marker::PhantomData<*const ()>,
}

impl Drop for GlobalContextGuard {
    fn drop(&mut self) {
        end_context();
    }
}

impl fmt::Debug for GlobalContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalContextGuard").finish_non_exhaustive()
    }
}

/// Records a breadcrumb.
///
/// See [`Forensics::add_breadcrumb`].
pub fn add_breadcrumb(name: &str, metadata: &[(&str, &str)]) {
    if let Some(runtime) = RUNTIME.get() {
        runtime.add_breadcrumb(name, metadata);
    }
}

/// Sets an attribute, or removes it when `value` is `None`.
///
/// See [`Forensics::set_attribute`].
pub fn set_attribute(key: &str, value: Option<&str>) {
    if let Some(runtime) = RUNTIME.get() {
        runtime.set_attribute(key, value);
    }
}

/// Reports a failed assertion through the process-wide runtime.
///
/// This is what the assertion macros expand to. With no runtime installed
/// the failure is printed by [`DefaultReportHandler`], and a fatal failure
/// still terminates the process.
pub fn report_assert_failure(
    site: CallSite<'_>,
    fatal: bool,
    expression: &str,
    format: &str,
    args: fmt::Arguments<'_>,
) {
    if let Some(runtime) = RUNTIME.get() {
        runtime.report_assert_failure(site, fatal, expression, format, args);
        return;
    }
    dispatch::dispatch_unconfigured(&Failure {
        site,
        fatal,
        expression,
        format,
        args,
    });
    if fatal {
        dispatch::halt();
    }
}

/// Reports a crash with no call site through the process-wide runtime.
///
/// Never waits for the runtime slot, so it can be called from a signal
/// handler. With no runtime available it writes a one-line record to stderr
/// and terminates the process.
pub fn report_crash(message: &str) {
    if let Some(runtime) = RUNTIME.try_get() {
        runtime.report_crash(message);
        return;
    }
    dispatch::write_minimal_record(&Failure {
        site: CallSite::UNKNOWN,
        fatal: true,
        expression: "",
        format: message,
        args: format_args!("{message}"),
    });
    dispatch::halt();
}

#[doc(hidden)]
pub mod __private {
    /// Trims the helper item and any closures off a `type_name` path.
    #[doc(hidden)]
    pub fn function_path(name: &'static str) -> &'static str {
        let mut path = name.strip_suffix("::__f").unwrap_or(name);
        while let Some(outer) = path.strip_suffix("::{{closure}}") {
            path = outer;
        }
        path
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_send_sync() {
        static_assertions::assert_impl_all!(Config: Send, Sync, Clone);
        static_assertions::assert_impl_all!(InitError: Send, Sync, core::error::Error);
        static_assertions::assert_impl_all!(ReportSnapshot: Send, Sync);
        static_assertions::assert_not_impl_any!(GlobalContextGuard: Send, Sync);
    }
}
