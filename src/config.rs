//! Runtime configuration.
//!
//! Every capacity is fixed when the runtime is created: all buffers are
//! allocated up front and never grow. Setting a capacity to zero turns the
//! matching feature off without affecting anything else.
//!
//! # Examples
//!
//! ```
//! use forensics::{Config, Report};
//!
//! let config = Config::new_from_env()
//!     .max_breadcrumb_count(32)
//!     .breadcrumb_buf_size_bytes(1024)
//!     .report_handler(|report: &Report<'_>| eprintln!("{}", report.id()));
//! # drop(config);
//! ```

use forensics_internals::{SharedAllocator, StorageAllocator, SystemAllocator, shared_allocator};

use crate::{
    backtrace::{BacktraceCapture, NoBacktrace, SharedBacktrace, default_capture, shared_backtrace},
    handler::{DefaultReportHandler, ReportHandler, SharedHandler, shared_handler},
};

/// Configuration of a [`Forensics`](crate::Forensics) runtime.
#[derive(Clone)]
pub struct Config {
    /// Whether a fatal report terminates the process once the handler returns.
    pub fatal_should_halt: bool,
    /// Size of the aggregation id buffer, terminator included.
    pub max_id_size_bytes: usize,
    /// Capacity of each thread's context stack.
    pub max_context_depth: usize,
    /// Size of the formatted message buffer, terminator included.
    pub max_formatted_message_size_bytes: usize,
    /// Maximum number of attributes.
    pub max_attribute_count: usize,
    /// Bytes available to attribute keys and values.
    pub attribute_buf_size_bytes: usize,
    /// Maximum number of captured frames.
    pub max_backtrace_count: usize,
    /// Maximum number of breadcrumbs.
    pub max_breadcrumb_count: usize,
    /// Bytes available to breadcrumb records.
    pub breadcrumb_buf_size_bytes: usize,
    /// Called with every report.
    pub report_handler: SharedHandler,
    /// Allocates every internal buffer.
    pub allocator: SharedAllocator,
    /// Captures backtraces.
    pub backtrace: SharedBacktrace,
    /// Whether [`initialize`](crate::initialize) installs the signal bridge.
    #[cfg(all(feature = "signals", unix))]
    #[cfg_attr(docsrs, doc(cfg(all(feature = "signals", unix))))]
    pub install_signal_handlers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fatal_should_halt: true,
            max_id_size_bytes: 512,
            max_context_depth: 128,
            max_formatted_message_size_bytes: 1024,
            max_attribute_count: 128,
            attribute_buf_size_bytes: 4096,
            max_backtrace_count: 256,
            max_breadcrumb_count: 128,
            breadcrumb_buf_size_bytes: 4096,
            report_handler: shared_handler(DefaultReportHandler),
            allocator: shared_allocator(SystemAllocator),
            backtrace: default_capture(),
            #[cfg(all(feature = "signals", unix))]
            install_signal_handlers: true,
        }
    }
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct("Config");
        s.field("fatal_should_halt", &self.fatal_should_halt)
            .field("max_id_size_bytes", &self.max_id_size_bytes)
            .field("max_context_depth", &self.max_context_depth)
            .field(
                "max_formatted_message_size_bytes",
                &self.max_formatted_message_size_bytes,
            )
            .field("max_attribute_count", &self.max_attribute_count)
            .field("attribute_buf_size_bytes", &self.attribute_buf_size_bytes)
            .field("max_backtrace_count", &self.max_backtrace_count)
            .field("max_breadcrumb_count", &self.max_breadcrumb_count)
            .field("breadcrumb_buf_size_bytes", &self.breadcrumb_buf_size_bytes);
        #[cfg(all(feature = "signals", unix))]
        s.field("install_signal_handlers", &self.install_signal_handlers);
        s.finish_non_exhaustive()
    }
}

/// Options parsed from the `FORENSICS` environment variable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct EnvOptions {
    no_halt: bool,
    no_backtrace: bool,
    #[cfg_attr(not(all(feature = "signals", unix)), allow(dead_code))]
    no_signals: bool,
}

impl EnvOptions {
    fn parse(var: &str) -> Self {
        let mut options = Self::default();
        for option in var.split(',').map(str::trim) {
            if option.eq_ignore_ascii_case("nohalt") {
                options.no_halt = true;
            } else if option.eq_ignore_ascii_case("nobacktrace") {
                options.no_backtrace = true;
            } else if option.eq_ignore_ascii_case("nosignals") {
                options.no_signals = true;
            }
        }
        options
    }
}

impl Config {
    /// Creates the default configuration, adjusted by the environment.
    ///
    /// # Environment Variables
    ///
    /// - `FORENSICS` - Comma-separated options:
    ///   - `nohalt` - Fatal reports do not terminate the process
    ///   - `nobacktrace` - Reports carry no backtrace
    ///   - `nosignals` - [`initialize`](crate::initialize) leaves signal
    ///     dispositions alone
    ///
    /// Unknown options are ignored.
    pub fn new_from_env() -> Self {
        let options = std::env::var_os("FORENSICS")
            .map(|var| EnvOptions::parse(&var.to_string_lossy()))
            .unwrap_or_default();
        Self::default().with_env_options(options)
    }

    fn with_env_options(mut self, options: EnvOptions) -> Self {
        if options.no_halt {
            self.fatal_should_halt = false;
        }
        if options.no_backtrace {
            self.backtrace = shared_backtrace(NoBacktrace);
            self.max_backtrace_count = 0;
        }
        #[cfg(all(feature = "signals", unix))]
        if options.no_signals {
            self.install_signal_handlers = false;
        }
        self
    }

    /// Creates a configuration with every capacity set to zero.
    ///
    /// The resulting runtime still dispatches reports, with every section
    /// empty and the message and id blank.
    pub fn disabled() -> Self {
        Self {
            max_id_size_bytes: 0,
            max_context_depth: 0,
            max_formatted_message_size_bytes: 0,
            max_attribute_count: 0,
            attribute_buf_size_bytes: 0,
            max_backtrace_count: 0,
            max_breadcrumb_count: 0,
            breadcrumb_buf_size_bytes: 0,
            ..Self::default()
        }
    }

    /// Sets the `fatal_should_halt` field.
    pub fn fatal_should_halt(mut self, halt: bool) -> Self {
        self.fatal_should_halt = halt;
        self
    }

    /// Sets the `max_id_size_bytes` field.
    pub fn max_id_size_bytes(mut self, bytes: usize) -> Self {
        self.max_id_size_bytes = bytes;
        self
    }

    /// Sets the `max_context_depth` field.
    pub fn max_context_depth(mut self, depth: usize) -> Self {
        self.max_context_depth = depth;
        self
    }

    /// Sets the `max_formatted_message_size_bytes` field.
    pub fn max_formatted_message_size_bytes(mut self, bytes: usize) -> Self {
        self.max_formatted_message_size_bytes = bytes;
        self
    }

    /// Sets the `max_attribute_count` field.
    pub fn max_attribute_count(mut self, count: usize) -> Self {
        self.max_attribute_count = count;
        self
    }

    /// Sets the `attribute_buf_size_bytes` field.
    pub fn attribute_buf_size_bytes(mut self, bytes: usize) -> Self {
        self.attribute_buf_size_bytes = bytes;
        self
    }

    /// Sets the `max_backtrace_count` field.
    pub fn max_backtrace_count(mut self, count: usize) -> Self {
        self.max_backtrace_count = count;
        self
    }

    /// Sets the `max_breadcrumb_count` field.
    pub fn max_breadcrumb_count(mut self, count: usize) -> Self {
        self.max_breadcrumb_count = count;
        self
    }

    /// Sets the `breadcrumb_buf_size_bytes` field.
    pub fn breadcrumb_buf_size_bytes(mut self, bytes: usize) -> Self {
        self.breadcrumb_buf_size_bytes = bytes;
        self
    }

    /// Replaces the report handler.
    pub fn report_handler<H: ReportHandler>(mut self, handler: H) -> Self {
        self.report_handler = shared_handler(handler);
        self
    }

    /// Replaces the allocator used for every internal buffer.
    pub fn allocator<A: StorageAllocator>(mut self, allocator: A) -> Self {
        self.allocator = shared_allocator(allocator);
        self
    }

    /// Replaces the backtrace collaborator.
    pub fn backtrace_capture<B: BacktraceCapture>(mut self, capture: B) -> Self {
        self.backtrace = shared_backtrace(capture);
        self
    }

    /// Sets the `install_signal_handlers` field.
    #[cfg(all(feature = "signals", unix))]
    #[cfg_attr(docsrs, doc(cfg(all(feature = "signals", unix))))]
    pub fn install_signal_handlers(mut self, install: bool) -> Self {
        self.install_signal_handlers = install;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.fatal_should_halt);
        assert_eq!(config.max_id_size_bytes, 512);
        assert_eq!(config.max_context_depth, 128);
        assert_eq!(config.max_formatted_message_size_bytes, 1024);
        assert_eq!(config.max_attribute_count, 128);
        assert_eq!(config.attribute_buf_size_bytes, 4096);
        assert_eq!(config.max_backtrace_count, 256);
        assert_eq!(config.max_breadcrumb_count, 128);
        assert_eq!(config.breadcrumb_buf_size_bytes, 4096);
    }

    #[test]
    fn test_env_options() {
        assert_eq!(EnvOptions::parse(""), EnvOptions::default());
        assert_eq!(
            EnvOptions::parse("NoHalt, nosignals,bogus"),
            EnvOptions {
                no_halt: true,
                no_backtrace: false,
                no_signals: true,
            }
        );

        let config = Config::default().with_env_options(EnvOptions::parse("nohalt,nobacktrace"));
        assert!(!config.fatal_should_halt);
        assert_eq!(config.max_backtrace_count, 0);
    }

    #[test]
    fn test_disabled_keeps_behavior_flags() {
        let config = Config::disabled().fatal_should_halt(false);
        assert!(!config.fatal_should_halt);
        assert_eq!(config.max_attribute_count, 0);
        assert_eq!(config.breadcrumb_buf_size_bytes, 0);
        assert!(format!("{config:?}").starts_with("Config {"));
    }
}
