//! Report assembly and dispatch.
//!
//! Everything on this path writes into buffers allocated at init. It takes no
//! locks besides the ones its caller already holds and a `try_lock` on the
//! calling thread's context stack, and it emits no `tracing` events, since it
//! can run inside a signal handler.

use core::fmt::{self, Write as _};

use forensics_internals::{BreadcrumbSlot, FixedBuf};

use crate::{
    Config, InitError,
    backtrace::FrameAddress,
    handler::{DefaultReportHandler, ReportHandler},
    report::{Attributes, Breadcrumbs, CallSite, NO_CONTEXT, Report},
    runtime::{Forensics, Shared},
};

/// One failure, as raised by the caller.
pub(crate) struct Failure<'a> {
    pub(crate) site: CallSite<'a>,
    pub(crate) fatal: bool,
    pub(crate) expression: &'a str,
    pub(crate) format: &'a str,
    pub(crate) args: fmt::Arguments<'a>,
}

/// Per-report working buffers.
pub(crate) struct Scratch {
    id: FixedBuf<u8>,
    message: FixedBuf<u8>,
    contexts: FixedBuf<&'static str>,
    breadcrumbs: FixedBuf<BreadcrumbSlot>,
    backtrace: FixedBuf<FrameAddress>,
}

impl Scratch {
    pub(crate) fn new_in(config: &Config) -> Result<Self, InitError> {
        let allocator = &config.allocator;
        Ok(Self {
            id: FixedBuf::new_in(config.max_id_size_bytes, 0, allocator)
                .map_err(InitError::allocation("report id buffer"))?,
            message: FixedBuf::new_in(config.max_formatted_message_size_bytes, 0, allocator)
                .map_err(InitError::allocation("report message buffer"))?,
            contexts: FixedBuf::new_in(config.max_context_depth, "", allocator)
                .map_err(InitError::allocation("report context snapshot"))?,
            breadcrumbs: FixedBuf::new_in(
                config.max_breadcrumb_count,
                BreadcrumbSlot::default(),
                allocator,
            )
            .map_err(InitError::allocation("report breadcrumb snapshot"))?,
            backtrace: FixedBuf::new_in(config.max_backtrace_count, FrameAddress::NULL, allocator)
                .map_err(InitError::allocation("backtrace buffer"))?,
        })
    }
}

/// Assembles a report from `shared` and hands it to the runtime's handler.
///
/// The caller holds the report lock and decides about halting.
pub(crate) fn dispatch_locked(runtime: &Forensics, shared: &mut Shared, failure: &Failure<'_>) {
    let Shared {
        attributes,
        breadcrumbs,
        scratch,
    } = shared;

    let formatted = render_terminated(&mut scratch.message, failure.args);

    let context_count = runtime
        .contexts
        .copy_current(runtime.id, &mut scratch.contexts);
    let contexts = &scratch.contexts[..context_count];

    let crumb_count = breadcrumbs.snapshot_into(&mut scratch.breadcrumbs);

    let frame_count = if scratch.backtrace.is_empty() {
        0
    } else {
        runtime
            .config
            .backtrace
            .capture(&mut scratch.backtrace)
            .min(scratch.backtrace.len())
    };

    let id = write_id(
        &mut scratch.id,
        contexts.last().copied(),
        failure.site.file,
        failure.site.function,
        failure.format,
    );

    let report = Report {
        id,
        site: failure.site,
        expression: failure.expression,
        format: failure.format,
        formatted,
        fatal: failure.fatal,
        contexts,
        attributes: Attributes::new(attributes),
        breadcrumbs: Breadcrumbs::new(breadcrumbs, &scratch.breadcrumbs[..crumb_count]),
        backtrace: &scratch.backtrace[..frame_count],
    };
    runtime.config.report_handler.handle(&report);
}

/// Reports a failure raised while no runtime is installed.
///
/// This path allocates, so it is never taken from a signal handler.
pub(crate) fn dispatch_unconfigured(failure: &Failure<'_>) {
    let formatted = failure.args.to_string();
    let id = format!(
        "{NO_CONTEXT}-{}-{}-{}",
        basename(failure.site.file),
        failure.site.function,
        failure.format
    );
    let report = Report {
        id: &id,
        site: failure.site,
        expression: failure.expression,
        format: failure.format,
        formatted: &formatted,
        fatal: failure.fatal,
        contexts: &[],
        attributes: Attributes::EMPTY,
        breadcrumbs: Breadcrumbs::EMPTY,
        backtrace: &[],
    };
    DefaultReportHandler.handle(&report);
}

/// Size of the buffer for records written without runtime state.
const MINIMAL_RECORD_SIZE: usize = 256;

/// Writes a one-line record of `failure` straight to stderr.
///
/// Used when the calling thread is already inside the runtime's report lock,
/// and for crashes with no runtime installed. The message arguments are not
/// formatted, since formatting them could re-enter the runtime yet again.
pub(crate) fn write_minimal_record(failure: &Failure<'_>) {
    let mut record = [0u8; MINIMAL_RECORD_SIZE];
    let mut writer = TruncatingWriter::new(&mut record[..MINIMAL_RECORD_SIZE - 1]);
    let _ = write!(
        writer,
        "forensics: unassembled {} failure at {}:{} in {}: {}",
        if failure.fatal { "fatal" } else { "non-fatal" },
        failure.site.file,
        failure.site.line,
        failure.site.function,
        failure.format,
    );
    let len = writer.len;
    record[len] = b'\n';
    emergency_write(&record[..=len]);
}

#[cfg(unix)]
fn emergency_write(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes, and
        // `write` does not retain the pointer.
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

#[cfg(not(unix))]
fn emergency_write(bytes: &[u8]) {
    use std::io::Write;

    let _ = std::io::stderr().write_all(bytes);
}

/// Terminates the process after a fatal report.
pub(crate) fn halt() -> ! {
    std::process::exit(1)
}

/// Strips everything up to the last path separator.
pub(crate) fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Formats the aggregation id into `buf`, returning it.
///
/// The id is truncated to fit `buf` with its terminator.
pub(crate) fn write_id<'a>(
    buf: &'a mut [u8],
    context: Option<&str>,
    file: &str,
    function: &str,
    format: &str,
) -> &'a str {
    render_terminated(
        buf,
        format_args!(
            "{}-{}-{}-{}",
            context.unwrap_or(NO_CONTEXT),
            basename(file),
            function,
            format
        ),
    )
}

/// Renders `args` into `buf`, leaving room for a terminator byte.
///
/// Output that does not fit is cut at the last character boundary that does.
pub(crate) fn render_terminated<'a>(buf: &'a mut [u8], args: fmt::Arguments<'_>) -> &'a str {
    let Some(usable) = buf.len().checked_sub(1) else {
        return "";
    };
    let mut writer = TruncatingWriter::new(&mut buf[..usable]);
    // a formatting error only means the output was truncated
    let _ = writer.write_fmt(args);
    let len = writer.len;
    buf[len] = 0;
    core::str::from_utf8(&buf[..len]).unwrap_or("")
}

/// A [`fmt::Write`] sink over a fixed slice that keeps whole characters only.
struct TruncatingWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> TruncatingWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }
}

impl fmt::Write for TruncatingWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = self.buf.len() - self.len;
        if s.len() <= available {
            self.buf[self.len..self.len + s.len()].copy_from_slice(s.as_bytes());
            self.len += s.len();
            return Ok(());
        }

        let mut cut = available;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf[self.len..self.len + cut].copy_from_slice(&s.as_bytes()[..cut]);
        self.len += cut;
        Err(fmt::Error)
    }
}
