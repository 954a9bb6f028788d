//! The diagnostics runtime.

use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use forensics_internals::{AttributeArena, AttributeError, BreadcrumbOutcome, BreadcrumbRing};
use triomphe::Arc;

use crate::{
    Config, InitError,
    context::ContextRegistry,
    dispatch::{self, Failure, Scratch},
    lock::{ReportGuard, ReportLock},
    report::CallSite,
};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every thread, guarded by the report lock.
pub(crate) struct Shared {
    pub(crate) attributes: AttributeArena,
    pub(crate) breadcrumbs: BreadcrumbRing,
    pub(crate) scratch: Scratch,
}

/// A diagnostics runtime: the attribute store, the breadcrumb trail, the
/// per-thread context stacks and everything needed to report a failure.
///
/// All memory is allocated by [`Forensics::new`] and released when the value
/// is dropped, including the context stacks of threads that are still
/// running. Most programs install one runtime process-wide with
/// [`initialize`](crate::initialize) and use the crate-level functions;
/// a `Forensics` value can also be used directly.
///
/// # Examples
///
/// ```
/// use forensics::{Config, Forensics, Report, call_site};
///
/// let forensics = Forensics::new(
///     Config::default()
///         .fatal_should_halt(false)
///         .report_handler(|report: &Report<'_>| {
///             assert_eq!(report.attributes().get("user"), Some("alice"));
///         }),
/// )
/// .expect("failed to allocate diagnostics storage");
///
/// forensics.set_attribute("user", Some("alice"));
/// forensics.add_breadcrumb("login", &[("ip", "1.2.3.4")]);
/// let _guard = forensics.context("session");
/// forensics.report_assert_failure(
///     call_site!(),
///     true,
///     "false",
///     "bad state {}",
///     format_args!("bad state {}", 7),
/// );
/// ```
pub struct Forensics {
    pub(crate) id: u64,
    pub(crate) config: Config,
    shared: ReportLock<Shared>,
    pub(crate) contexts: Arc<ContextRegistry>,
}

/// Reports an internal contract violation through the held report lock.
macro_rules! internal_failure {
    ($runtime:expr, $guard:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $runtime.dispatch_held(
            $guard,
            &Failure {
                site: $crate::call_site!(),
                fatal: true,
                expression: "false",
                format: $fmt,
                args: format_args!($fmt $(, $arg)*),
            },
        )
    };
}

impl Forensics {
    /// Allocates every buffer described by `config`.
    pub fn new(config: Config) -> Result<Self, InitError> {
        let allocator = &config.allocator;
        let shared = Shared {
            attributes: AttributeArena::new_in(
                config.max_attribute_count,
                config.attribute_buf_size_bytes,
                allocator,
            )
            .map_err(InitError::allocation("attribute store"))?,
            breadcrumbs: BreadcrumbRing::new_in(
                config.max_breadcrumb_count,
                config.breadcrumb_buf_size_bytes,
                allocator,
            )
            .map_err(InitError::allocation("breadcrumb trail"))?,
            scratch: Scratch::new_in(&config)?,
        };
        let contexts = Arc::new(ContextRegistry::new(
            config.max_context_depth,
            allocator.clone(),
        ));
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            runtime = id,
            max_attribute_count = config.max_attribute_count,
            attribute_buf_size_bytes = config.attribute_buf_size_bytes,
            max_breadcrumb_count = config.max_breadcrumb_count,
            breadcrumb_buf_size_bytes = config.breadcrumb_buf_size_bytes,
            max_context_depth = config.max_context_depth,
            max_backtrace_count = config.max_backtrace_count,
            "forensics runtime initialized"
        );

        Ok(Self {
            id,
            config,
            shared: ReportLock::new(shared),
            contexts,
        })
    }

    /// Returns the configuration the runtime was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pushes a context onto the calling thread's stack.
    ///
    /// Pushes beyond [`Config::max_context_depth`](crate::Config) are counted
    /// and popped again by the matching [`end_context`](Self::end_context),
    /// but do not appear in reports.
    pub fn begin_context(&self, name: &'static str) {
        ContextRegistry::begin(&self.contexts, self.id, name);
    }

    /// Pops the calling thread's newest context.
    ///
    /// Popping an empty stack is a fatal failure.
    pub fn end_context(&self) {
        if !self.contexts.end(self.id) {
            let Some(guard) = self.lock_shared("end_context") else {
                return;
            };
            internal_failure!(
                self,
                guard,
                "The forensics context stack underflowed. Do you have mismatched begin_context/end_context calls?"
            );
        }
    }

    /// Pushes a context that is popped when the returned guard drops.
    #[must_use = "the context ends as soon as the guard is dropped"]
    pub fn context(&self, name: &'static str) -> ContextGuard<'_> {
        self.begin_context(name);
        ContextGuard {
            runtime: self,
            _not_send: core::marker::PhantomData,
        }
    }

    /// Records a breadcrumb.
    ///
    /// A breadcrumb equal to the newest one (same name and metadata) only
    /// bumps that one's repetition count.
    pub fn add_breadcrumb(&self, name: &str, metadata: &[(&str, &str)]) {
        let Some(mut shared) = self.lock_shared("add_breadcrumb") else {
            return;
        };
        if shared.breadcrumbs.push(name, metadata) == BreadcrumbOutcome::Dropped {
            tracing::debug!(
                breadcrumb = name,
                size = BreadcrumbRing::encoded_size(name, metadata),
                capacity = shared.breadcrumbs.capacity_bytes(),
                "dropped breadcrumb larger than the whole trail"
            );
        }
    }

    /// Sets an attribute, or removes it when `value` is `None`.
    ///
    /// Re-setting a key moves it to the end of the attribute order. Running
    /// out of attribute space is a fatal failure.
    pub fn set_attribute(&self, key: &str, value: Option<&str>) {
        let Some(mut shared) = self.lock_shared("set_attribute") else {
            return;
        };
        if shared.attributes.is_disabled() {
            return;
        }

        let Some(value) = value else {
            if shared.attributes.remove(key) {
                tracing::trace!(key, "attribute removed");
            }
            return;
        };

        let replacing = shared.attributes.get(key).is_some();
        match shared.attributes.insert(key, value) {
            Ok(()) => {
                if replacing {
                    tracing::trace!(key, value, "attribute replaced");
                }
            }
            Err(AttributeError::SlotsExhausted { .. }) => internal_failure!(
                self,
                shared,
                "Cannot set attribute because the attribute key array is full. Try increasing the size of max_attribute_count. key={} value={}",
                key,
                value
            ),
            Err(AttributeError::BufferExhausted { needed, available }) => internal_failure!(
                self,
                shared,
                "Cannot set attribute because the attribute buffer is full. Try increasing the size of attribute_buf_size_bytes. attribute={}={} needed={} avail={}",
                key,
                value,
                needed,
                available
            ),
        }
    }

    /// Reports a failed assertion.
    ///
    /// `format` is the message's format string, used in the aggregation id,
    /// and `args` the message itself. A fatal failure terminates the process
    /// after the handler returns, unless
    /// [`Config::fatal_should_halt`](crate::Config) is off.
    pub fn report_assert_failure(
        &self,
        site: CallSite<'_>,
        fatal: bool,
        expression: &str,
        format: &str,
        args: fmt::Arguments<'_>,
    ) {
        let failure = Failure {
            site,
            fatal,
            expression,
            format,
            args,
        };
        match self.shared.lock() {
            Some(guard) => self.dispatch_held(guard, &failure),
            None => {
                dispatch::write_minimal_record(&failure);
                if fatal && self.config.fatal_should_halt {
                    dispatch::halt();
                }
            }
        }
    }

    /// Reports a crash with no call site, as the signal bridge does.
    pub fn report_crash(&self, message: &str) {
        self.report_assert_failure(
            CallSite::UNKNOWN,
            true,
            "",
            message,
            format_args!("{message}"),
        );
    }

    /// Shuts the runtime down, releasing all of its memory.
    pub fn shutdown(self) {
        drop(self);
    }

    /// Returns the number of attributes.
    pub fn attribute_count(&self) -> usize {
        self.shared.lock().map_or(0, |shared| shared.attributes.len())
    }

    /// Returns the number of attribute buffer bytes in use.
    pub fn attribute_bytes_used(&self) -> usize {
        self.shared
            .lock()
            .map_or(0, |shared| shared.attributes.used_bytes())
    }

    /// Returns a copy of an attribute's value.
    pub fn attribute(&self, key: &str) -> Option<String> {
        let shared = self.shared.lock()?;
        shared.attributes.get(key).map(str::to_owned)
    }

    /// Returns the number of breadcrumbs.
    pub fn breadcrumb_count(&self) -> usize {
        self.shared.lock().map_or(0, |shared| shared.breadcrumbs.len())
    }

    /// Returns the depth of the calling thread's context stack.
    pub fn context_depth(&self) -> usize {
        self.contexts.depth(self.id)
    }

    /// Returns how many of the calling thread's contexts did not fit.
    pub fn context_overflow(&self) -> usize {
        self.contexts.overflow(self.id)
    }

    fn lock_shared(&self, operation: &'static str) -> Option<ReportGuard<'_, Shared>> {
        let guard = self.shared.lock();
        if guard.is_none() {
            tracing::warn!(operation, "skipped forensics call made while reporting");
        }
        guard
    }

    fn dispatch_held(&self, mut guard: ReportGuard<'_, Shared>, failure: &Failure<'_>) {
        dispatch::dispatch_locked(self, &mut guard, failure);
        drop(guard);
        if failure.fatal && self.config.fatal_should_halt {
            dispatch::halt();
        }
    }
}

impl Drop for Forensics {
    fn drop(&mut self) {
        let reclaimed = self.contexts.close();
        tracing::info!(
            runtime = self.id,
            reclaimed_context_stacks = reclaimed,
            "forensics runtime shut down"
        );
    }
}

impl fmt::Debug for Forensics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forensics")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Ends a context of a [`Forensics`] value when dropped.
///
/// Returned by [`Forensics::context`].
#[must_use = "the context ends as soon as the guard is dropped"]
pub struct ContextGuard<'a> {
    runtime: &'a Forensics,
    /// Contexts belong to the thread that began them.
    _not_send: core::marker::PhantomData<*const ()>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.runtime.end_context();
    }
}

impl fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use core::{alloc::Layout, ptr::NonNull, sync::atomic::AtomicUsize};
    use std::sync::{Mutex, mpsc};

    use forensics_internals::{StorageAllocator, SystemAllocator};

    use super::*;
    use crate::{Report, ReportSnapshot, backtrace::FrameAddress};

    type Reports = std::sync::Arc<Mutex<Vec<ReportSnapshot>>>;

    fn collecting(config: Config) -> (Forensics, Reports) {
        let reports = Reports::default();
        let sink = reports.clone();
        let forensics = Forensics::new(
            config
                .fatal_should_halt(false)
                .report_handler(move |report: &Report<'_>| {
                    sink.lock().unwrap().push(report.snapshot());
                }),
        )
        .unwrap();
        (forensics, reports)
    }

    fn fail(forensics: &Forensics, format: &'static str) {
        forensics.report_assert_failure(
            CallSite::new("src/app/worker.rs", 10, "app::worker::run"),
            false,
            "ok",
            format,
            format_args!("{format}"),
        );
    }

    #[test]
    fn test_forensics_send_sync() {
        static_assertions::assert_impl_all!(Forensics: Send, Sync);
        static_assertions::assert_not_impl_any!(ContextGuard<'static>: Send);
    }

    #[test]
    fn test_end_to_end_report() {
        let (forensics, reports) = collecting(Config::default());
        forensics.set_attribute("user", Some("alice"));
        forensics.add_breadcrumb("login", &[("ip", "1.2.3.4")]);
        forensics.report_assert_failure(
            CallSite::new("src/auth.rs", 42, "auth::check"),
            true,
            "false",
            "bad state {}",
            format_args!("bad state {}", 7),
        );

        let reports = reports.lock().unwrap();
        let [report] = reports.as_slice() else {
            panic!("expected exactly one report, got {}", reports.len());
        };
        assert_eq!(report.attributes, [("user".to_owned(), "alice".to_owned())]);
        assert_eq!(report.breadcrumbs.len(), 1);
        assert_eq!(report.breadcrumbs[0].name, "login");
        assert_eq!(
            report.breadcrumbs[0].metadata,
            [("ip".to_owned(), "1.2.3.4".to_owned())]
        );
        assert_eq!(report.breadcrumbs[0].count, 1);
        assert_eq!(report.formatted, "bad state 7");
        assert!(report.fatal);
        assert_eq!(report.expression, "false");
        assert_eq!(report.id, "<none>-auth.rs-auth::check-bad state {}");
    }

    #[test]
    fn test_contexts_reported_bottom_to_top() {
        let (forensics, reports) = collecting(Config::default());
        forensics.begin_context("outer");
        {
            let _inner = forensics.context("inner");
            assert_eq!(forensics.context_depth(), 2);
            fail(&forensics, "boom");
        }
        assert_eq!(forensics.context_depth(), 1);
        forensics.end_context();

        let reports = reports.lock().unwrap();
        assert_eq!(reports[0].contexts, ["outer", "inner"]);
        assert!(reports[0].id.starts_with("inner-worker.rs-app::worker::run-boom"));
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn test_underflow_is_reported() {
        let (forensics, reports) = collecting(Config::default());
        forensics.end_context();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].fatal);
        assert!(reports[0].formatted.contains("context stack underflowed"));
    }

    #[test]
    fn test_attribute_exhaustion_is_reported() {
        let (forensics, reports) = collecting(
            Config::default()
                .max_attribute_count(1)
                .attribute_buf_size_bytes(16),
        );
        forensics.set_attribute("a", Some("1"));
        forensics.set_attribute("b", Some("2"));
        forensics.set_attribute("a", Some("0123456789abcdef"));

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].formatted.contains("max_attribute_count"));
        assert!(reports[0].formatted.contains("key=b value=2"));
        assert!(reports[1].formatted.contains("attribute_buf_size_bytes"));
        assert!(reports[1].formatted.contains("needed=19 avail=16"));
        // the old value is cleared before the new one is appended
        assert!(reports[1].attributes.is_empty());
    }

    #[test]
    fn test_attribute_set_and_clear() {
        let (forensics, _) = collecting(Config::default());
        forensics.set_attribute("build", Some("1234"));
        let before = (forensics.attribute_count(), forensics.attribute_bytes_used());

        forensics.set_attribute("user", Some("alice"));
        forensics.set_attribute("user", Some("bob"));
        assert_eq!(forensics.attribute("user").as_deref(), Some("bob"));
        assert_eq!(forensics.attribute_count(), 2);

        forensics.set_attribute("user", None);
        forensics.set_attribute("missing", None);
        assert_eq!(
            (forensics.attribute_count(), forensics.attribute_bytes_used()),
            before
        );
    }

    #[test]
    fn test_breadcrumbs_coalesce() {
        let (forensics, reports) = collecting(Config::default());
        forensics.add_breadcrumb("tick", &[]);
        forensics.add_breadcrumb("tick", &[]);
        forensics.add_breadcrumb("tock", &[("n", "1")]);
        assert_eq!(forensics.breadcrumb_count(), 2);
        fail(&forensics, "boom");

        let reports = reports.lock().unwrap();
        let counts: Vec<_> = reports[0]
            .breadcrumbs
            .iter()
            .map(|crumb| (crumb.name.as_str(), crumb.count))
            .collect();
        assert_eq!(counts, [("tick", 2), ("tock", 1)]);
    }

    #[test]
    fn test_id_ignores_state() {
        let (forensics, reports) = collecting(
            Config::default().backtrace_capture(|frames: &mut [FrameAddress]| {
                frames.fill(FrameAddress::new(0x1234 as *mut _));
                frames.len()
            }),
        );
        fail(&forensics, "same");
        forensics.set_attribute("user", Some("alice"));
        forensics.add_breadcrumb("login", &[]);
        fail(&forensics, "same");

        let reports = reports.lock().unwrap();
        assert_eq!(reports[0].id, reports[1].id);
        assert_eq!(reports[0].id, "<none>-worker.rs-app::worker::run-same");
        assert_eq!(reports[1].backtrace.len(), 256);
    }

    #[test]
    fn test_disabled_runtime_reports_empty_sections() {
        let (forensics, reports) = collecting(Config::disabled());
        forensics.set_attribute("user", Some("alice"));
        forensics.set_attribute("user", None);
        forensics.add_breadcrumb("login", &[("ip", "1.2.3.4")]);
        forensics.begin_context("ctx");
        assert_eq!(forensics.context_overflow(), 1);
        fail(&forensics, "boom");
        forensics.end_context();

        assert_eq!(forensics.attribute_count(), 0);
        assert_eq!(forensics.breadcrumb_count(), 0);
        let reports = reports.lock().unwrap();
        let report = &reports[0];
        assert!(report.attributes.is_empty());
        assert!(report.breadcrumbs.is_empty());
        assert!(report.contexts.is_empty());
        assert!(report.backtrace.is_empty());
        assert_eq!(report.formatted, "");
        assert_eq!(report.id, "");
        assert_eq!(report.file, "src/app/worker.rs");
    }

    #[test]
    fn test_reentrant_calls_do_not_deadlock() {
        let reports = Reports::default();
        let sink = reports.clone();
        let runtime = std::sync::Arc::new(std::sync::OnceLock::<Forensics>::new());
        let inner = runtime.clone();
        let forensics = Forensics::new(Config::default().fatal_should_halt(false).report_handler(
            move |report: &Report<'_>| {
                if let Some(forensics) = inner.get() {
                    // all of these are refused while the report lock is held
                    forensics.set_attribute("nested", Some("1"));
                    forensics.add_breadcrumb("nested", &[]);
                    fail(forensics, "nested");
                }
                sink.lock().unwrap().push(report.snapshot());
            },
        ))
        .unwrap();
        assert!(runtime.set(forensics).is_ok());
        let Some(forensics) = runtime.get() else {
            unreachable!()
        };

        fail(forensics, "outer");
        assert_eq!(reports.lock().unwrap().len(), 1);
        assert_eq!(forensics.attribute_count(), 0);
        assert_eq!(forensics.breadcrumb_count(), 0);
    }

    #[test]
    fn test_message_truncation() {
        let (forensics, reports) =
            collecting(Config::default().max_formatted_message_size_bytes(6));
        fail(&forensics, "abcdefgh");
        assert_eq!(reports.lock().unwrap()[0].formatted, "abcde");
    }

    /// Tracks the bytes currently allocated through it.
    struct CountingAllocator {
        live_bytes: std::sync::Arc<AtomicUsize>,
    }

    // SAFETY: every call is forwarded to `SystemAllocator` unchanged.
    unsafe impl StorageAllocator for CountingAllocator {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            let ptr = SystemAllocator.allocate(layout)?;
            self.live_bytes.fetch_add(layout.size(), Ordering::SeqCst);
            Some(ptr)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.live_bytes.fetch_sub(layout.size(), Ordering::SeqCst);
            // SAFETY: the block came from `SystemAllocator` with this layout.
            unsafe { SystemAllocator.deallocate(ptr, layout) }
        }
    }

    #[test]
    fn test_shutdown_releases_every_allocation() {
        let live_bytes = std::sync::Arc::new(AtomicUsize::new(0));
        let forensics = std::sync::Arc::new(
            Forensics::new(Config::default().allocator(CountingAllocator {
                live_bytes: live_bytes.clone(),
            }))
            .unwrap(),
        );
        let after_init = live_bytes.load(Ordering::SeqCst);
        assert!(after_init > 0);

        forensics.begin_context("main");
        let with_main = live_bytes.load(Ordering::SeqCst);
        assert!(with_main > after_init);

        let exited = forensics.clone();
        std::thread::spawn(move || exited.begin_context("exited"))
            .join()
            .unwrap();
        // the exited thread's stack was freed with its thread-locals
        assert_eq!(live_bytes.load(Ordering::SeqCst), with_main);

        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let parked = {
            let forensics = forensics.clone();
            std::thread::spawn(move || {
                forensics.begin_context("parked");
                drop(forensics);
                ready_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        ready_rx.recv().unwrap();
        assert!(live_bytes.load(Ordering::SeqCst) > with_main);

        let Ok(forensics) = std::sync::Arc::try_unwrap(forensics) else {
            panic!("the runtime is still shared");
        };
        forensics.shutdown();
        assert_eq!(live_bytes.load(Ordering::SeqCst), 0);

        // a thread outliving the runtime frees nothing twice when it exits
        done_tx.send(()).unwrap();
        parked.join().unwrap();
        assert_eq!(live_bytes.load(Ordering::SeqCst), 0);
    }
}
