//! Bridge from fatal unix signals to crash reports.
//!
//! [`initialize`](crate::initialize) registers the bridge when
//! [`Config::install_signal_handlers`](crate::Config) is set, and
//! [`shutdown`](crate::shutdown) restores the default dispositions. A caught
//! signal is reported as a fatal failure through the installed runtime.

use core::{
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

/// Signals routed into the report path, in registration order.
const SIGNALS: [libc::c_int; 5] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
];

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Registers the crash handler for `SIGABRT`, `SIGBUS`, `SIGFPE`, `SIGILL`
/// and `SIGSEGV`.
///
/// Does nothing if the handlers are already registered. A failed
/// registration is reported as a crash.
pub fn register_handlers() {
    if HANDLERS_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut failed = false;
    for signal in SIGNALS {
        failed |= !set_disposition(signal, handle_signal as libc::sighandler_t);
    }
    if failed {
        crate::report_crash("failed to register signal handlers");
    } else {
        tracing::debug!(signals = ?SIGNALS, "forensics signal handlers registered");
    }
}

/// Restores the default disposition of every signal the bridge handles.
///
/// Does nothing unless [`register_handlers`] ran before.
pub fn unregister_handlers() {
    if !HANDLERS_INSTALLED.swap(false, Ordering::AcqRel) {
        return;
    }
    let mut failed = false;
    for signal in SIGNALS.into_iter().rev() {
        failed |= !set_disposition(signal, libc::SIG_DFL);
    }
    if failed {
        crate::report_crash("failed to unregister signal handlers");
    }
}

/// Returns whether the bridge is currently registered.
pub fn handlers_installed() -> bool {
    HANDLERS_INSTALLED.load(Ordering::Acquire)
}

fn set_disposition(signal: libc::c_int, handler: libc::sighandler_t) -> bool {
    // SAFETY: `sigaction` is a plain C struct for which all-zeroes is a valid
    // value.
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = libc::SA_SIGINFO;
    // SAFETY: `action.sa_mask` is a valid, writable signal set.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    // SAFETY: `action` is fully initialized and the old action is not asked
    // for.
    unsafe { libc::sigaction(signal, &action, ptr::null_mut()) == 0 }
}

fn message_for(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGABRT => "got signal: SIGABRT",
        libc::SIGBUS => "got signal: SIGBUS",
        libc::SIGFPE => "got signal: SIGFPE",
        libc::SIGILL => "got signal: SIGILL",
        libc::SIGSEGV => "got signal: SIGSEGV",
        _ => "got unexpected signal",
    }
}

extern "C" fn handle_signal(
    signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let saved_errno = errno::get();

    crate::report_crash(message_for(signal));

    // halting is off; let a re-executed fault terminate normally
    set_disposition(signal, libc::SIG_DFL);
    errno::set(saved_errno);
}

mod errno {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "fuchsia", target_os = "redox"))] {
            pub(super) fn location() -> *mut libc::c_int {
                // SAFETY: always returns the calling thread's errno slot.
                unsafe { libc::__errno_location() }
            }
        } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "dragonfly"))] {
            pub(super) fn location() -> *mut libc::c_int {
                // SAFETY: always returns the calling thread's errno slot.
                unsafe { libc::__error() }
            }
        } else if #[cfg(any(target_os = "android", target_os = "openbsd", target_os = "netbsd"))] {
            pub(super) fn location() -> *mut libc::c_int {
                // SAFETY: always returns the calling thread's errno slot.
                unsafe { libc::__errno() }
            }
        } else {
            pub(super) fn location() -> *mut libc::c_int {
                core::ptr::null_mut()
            }
        }
    }

    pub(super) fn get() -> libc::c_int {
        let slot = location();
        if slot.is_null() {
            return 0;
        }
        // SAFETY: a non-null errno slot is valid for the calling thread.
        unsafe { *slot }
    }

    pub(super) fn set(value: libc::c_int) {
        let slot = location();
        if !slot.is_null() {
            // SAFETY: a non-null errno slot is valid for the calling thread.
            unsafe { *slot = value }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_disposition(signal: libc::c_int) -> libc::sighandler_t {
        // SAFETY: all-zeroes is a valid `sigaction`.
        let mut old: libc::sigaction = unsafe { core::mem::zeroed() };
        // SAFETY: only queries the current action.
        let result = unsafe { libc::sigaction(signal, ptr::null(), &mut old) };
        assert_eq!(result, 0);
        old.sa_sigaction
    }

    #[test]
    fn test_messages() {
        assert_eq!(message_for(libc::SIGSEGV), "got signal: SIGSEGV");
        assert_eq!(message_for(libc::SIGABRT), "got signal: SIGABRT");
        assert_eq!(message_for(libc::SIGUSR1), "got unexpected signal");
    }

    #[test]
    fn test_register_then_unregister() {
        register_handlers();
        assert!(handlers_installed());
        for signal in SIGNALS {
            assert_eq!(current_disposition(signal), handle_signal as libc::sighandler_t);
        }

        unregister_handlers();
        assert!(!handlers_installed());
        for signal in SIGNALS {
            assert_eq!(current_disposition(signal), libc::SIG_DFL);
        }
        // a second unregister is a no-op
        unregister_handlers();
    }

    #[test]
    fn test_errno_round_trip() {
        let before = errno::get();
        errno::set(libc::EINTR);
        if !errno::location().is_null() {
            assert_eq!(errno::get(), libc::EINTR);
        }
        errno::set(before);
    }
}
