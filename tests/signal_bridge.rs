//! Routes a real signal through the installed bridge.
//!
//! - a caught signal becomes a fatal report with no call site
//! - the message doubles as the format string
//! - `errno` survives the handler
//! - the disposition is reset once the report returns
//! - shutdown unregisters the bridge
#![cfg(all(feature = "signals", unix))]

use std::sync::{Arc, Mutex};

use forensics::{Config, Report, ReportSnapshot};

#[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "fuchsia"))]
fn errno_slot() -> Option<*mut libc::c_int> {
    // SAFETY: returns the calling thread's errno slot.
    Some(unsafe { libc::__errno_location() })
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_slot() -> Option<*mut libc::c_int> {
    // SAFETY: returns the calling thread's errno slot.
    Some(unsafe { libc::__error() })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "emscripten",
    target_os = "fuchsia",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn errno_slot() -> Option<*mut libc::c_int> {
    None
}

fn current_disposition(signal: libc::c_int) -> libc::sighandler_t {
    // SAFETY: all-zeroes is a valid `sigaction`.
    let mut old: libc::sigaction = unsafe { core::mem::zeroed() };
    // SAFETY: only queries the current action.
    let result = unsafe { libc::sigaction(signal, core::ptr::null(), &mut old) };
    assert_eq!(result, 0);
    old.sa_sigaction
}

#[test]
fn test_signal_becomes_fatal_report() {
    let reports = Arc::new(Mutex::new(Vec::<ReportSnapshot>::new()));
    let sink = reports.clone();
    forensics::initialize(
        Config::default()
            .fatal_should_halt(false)
            .max_backtrace_count(0)
            .install_signal_handlers(true)
            .report_handler(move |report: &Report<'_>| {
                sink.lock().unwrap().push(report.snapshot());
            }),
    )
    .unwrap();
    assert!(forensics::signals::handlers_installed());
    assert_ne!(current_disposition(libc::SIGFPE), libc::SIG_DFL);

    forensics::set_attribute("phase", Some("compute"));
    if let Some(slot) = errno_slot() {
        // SAFETY: the slot belongs to this thread.
        unsafe { *slot = libc::EAGAIN };
    }

    // SAFETY: the handler is installed and halting is off, so this returns.
    assert_eq!(unsafe { libc::raise(libc::SIGFPE) }, 0);

    if let Some(slot) = errno_slot() {
        // SAFETY: the slot belongs to this thread.
        assert_eq!(unsafe { *slot }, libc::EAGAIN);
    }
    assert_eq!(current_disposition(libc::SIGFPE), libc::SIG_DFL);

    {
        let reports = reports.lock().unwrap();
        let [report] = reports.as_slice() else {
            panic!("expected exactly one report, got {}", reports.len());
        };
        assert!(report.fatal);
        assert_eq!(report.formatted, "got signal: SIGFPE");
        assert_eq!(report.format, "got signal: SIGFPE");
        assert_eq!(report.file, "");
        assert_eq!(report.line, 0);
        assert_eq!(report.function, "");
        assert_eq!(report.id, "<none>---got signal: SIGFPE");
        assert_eq!(report.attribute("phase"), Some("compute"));
    }

    forensics::shutdown();
    assert!(!forensics::signals::handlers_installed());
    assert_eq!(current_disposition(libc::SIGABRT), libc::SIG_DFL);
}
