//! Report handlers.
//!
//! A handler is called synchronously, on the failing thread, once per report.
//! The report lock is held for the duration of the call, so a handler should
//! return promptly. Calls the handler makes back into the same runtime do not
//! deadlock: failures degrade to a one-line record and mutations are skipped.

use std::io::Write;

use triomphe::Arc;
use unsize::CoerceUnsize;

use crate::Report;

/// Receives every assembled [`Report`].
///
/// Closures taking a `&Report<'_>` implement this trait.
///
/// # Examples
///
/// ```
/// use forensics::{Config, Report};
///
/// let config = Config::default().report_handler(|report: &Report<'_>| {
///     eprintln!("[{}] {}", report.id(), report.formatted());
/// });
/// # drop(config);
/// ```
pub trait ReportHandler: 'static + Send + Sync {
    /// Handles one report. The report is only valid for this call; use
    /// [`Report::snapshot`] to keep its data.
    fn handle(&self, report: &Report<'_>);
}

impl<F> ReportHandler for F
where
    F: Fn(&Report<'_>) + 'static + Send + Sync,
{
    fn handle(&self, report: &Report<'_>) {
        self(report)
    }
}

/// Shared handle to a type-erased [`ReportHandler`].
pub type SharedHandler = Arc<dyn ReportHandler>;

pub(crate) fn shared_handler<H: ReportHandler>(handler: H) -> SharedHandler {
    Arc::new(handler).unsize(unsize::Coercion!(to dyn ReportHandler))
}

/// Writes the structured dump of each report to standard error.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultReportHandler;

impl ReportHandler for DefaultReportHandler {
    fn handle(&self, report: &Report<'_>) {
        let stderr = std::io::stderr();
        let mut stderr = stderr.lock();
        // nowhere left to report a failing stderr
        let _ = write!(stderr, "{report}");
        let _ = stderr.flush();
    }
}
