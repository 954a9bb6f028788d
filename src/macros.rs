/// Checks a condition and reports a fatal failure if it does not hold.
///
/// The macro evaluates to the `bool` result of the condition, so it can guard
/// recovery code when halting is turned off. An optional message follows the
/// condition, interpreted the same way as by [`format!()`]. The format string
/// itself is part of the report's aggregation id.
///
/// By default the failure is reported through the runtime installed with
/// [`initialize`](crate::initialize). Prefix the arguments with
/// `in <runtime>;` to use an explicit [`Forensics`](crate::Forensics) value.
///
/// [`format!()`]: std::format
///
/// # Examples
///
/// ```
/// use forensics::{Config, Forensics, forensics_assert};
///
/// let forensics = Forensics::new(Config::default().fatal_should_halt(false))?;
/// let queue_len = 3;
///
/// assert!(forensics_assert!(in forensics; queue_len < 10));
/// forensics_assert!(in forensics; queue_len < 10, "queue too long: {}", queue_len);
/// # Ok::<(), forensics::InitError>(())
/// ```
#[macro_export]
macro_rules! forensics_assert {
    (in $runtime:expr; $($rest:tt)+) => {
        $crate::__forensics_check!(($runtime) true; $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__forensics_check!(() true; $($rest)+)
    };
}

/// Like [`forensics_assert!`], but the failure is not fatal.
///
/// ```
/// use forensics::{Config, Forensics, forensics_verify};
///
/// let forensics = Forensics::new(Config::default())?;
/// let ready = forensics_verify!(in forensics; 1 + 1 == 2, "math is broken");
/// assert!(ready);
/// # Ok::<(), forensics::InitError>(())
/// ```
#[macro_export]
macro_rules! forensics_verify {
    (in $runtime:expr; $($rest:tt)+) => {
        $crate::__forensics_check!(($runtime) false; $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__forensics_check!(() false; $($rest)+)
    };
}

/// Like [`forensics_assert!`], but only checked when `debug_assertions` are
/// enabled. Evaluates to `true` otherwise.
#[macro_export]
macro_rules! forensics_assert_dbg {
    ($($rest:tt)+) => {
        if ::core::cfg!(debug_assertions) {
            $crate::forensics_assert!($($rest)+)
        } else {
            true
        }
    };
}

/// Pushes a context for the rest of the enclosing scope.
///
/// # Examples
///
/// ```
/// use forensics::{Config, Forensics, forensics_context};
///
/// let forensics = Forensics::new(Config::default())?;
/// {
///     forensics_context!(in forensics; "load config");
///     assert_eq!(forensics.context_depth(), 1);
/// }
/// assert_eq!(forensics.context_depth(), 0);
/// # Ok::<(), forensics::InitError>(())
/// ```
#[macro_export]
macro_rules! forensics_context {
    (in $runtime:expr; $name:expr $(,)?) => {
        let _forensics_context = $crate::Forensics::context(&$runtime, $name);
    };
    ($name:expr $(,)?) => {
        let _forensics_context = $crate::context($name);
    };
}

/// Builds the [`CallSite`](crate::CallSite) of the macro invocation.
///
/// The function is the path of the enclosing function, with closures
/// attributed to the function that defines them.
#[macro_export]
macro_rules! call_site {
    () => {
        $crate::CallSite::new(::core::file!(), ::core::line!(), {
            fn __f() {}
            $crate::__private::function_path(::core::any::type_name_of_val(&__f))
        })
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __forensics_check {
    (@report () $($args:tt)*) => {
        $crate::report_assert_failure($($args)*)
    };
    (@report ($runtime:expr) $($args:tt)*) => {
        $crate::Forensics::report_assert_failure(&$runtime, $($args)*)
    };
    (($($runtime:expr)?) $fatal:literal; $cond:expr $(,)?) => {
        $crate::__forensics_check!(($($runtime)?) $fatal; $cond, "")
    };
    (($($runtime:expr)?) $fatal:literal; $cond:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let passed: bool = $cond;
        if !passed {
            $crate::__forensics_check!(
                @report ($($runtime)?)
                $crate::call_site!(),
                $fatal,
                ::core::stringify!($cond),
                $fmt,
                ::core::format_args!($fmt $(, $arg)*)
            );
        }
        passed
    }};
}
