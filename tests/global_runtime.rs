//! Exercises the process-wide runtime.
//!
//! The runtime is a process global, so everything runs in a single test.
//!
//! - initialize, then a second initialize is refused
//! - attributes, breadcrumbs and contexts reach the handler
//! - contexts are per thread
//! - shutdown, after which the calls are no-ops and initialize works again

use std::sync::{Arc, Mutex};

use forensics::{
    Config, InitError, Report, ReportSnapshot, forensics_assert, forensics_context,
    forensics_verify,
};

type Reports = Arc<Mutex<Vec<ReportSnapshot>>>;

fn config(reports: &Reports) -> Config {
    let sink = reports.clone();
    let config = Config::default()
        .fatal_should_halt(false)
        .max_backtrace_count(8)
        .report_handler(move |report: &Report<'_>| {
            sink.lock().unwrap().push(report.snapshot());
        });
    #[cfg(all(feature = "signals", unix))]
    let config = config.install_signal_handlers(false);
    config
}

#[test]
fn test_global_lifecycle() {
    let reports = Reports::default();
    assert!(!forensics::is_initialized());

    forensics::initialize(config(&reports)).unwrap();
    assert!(forensics::is_initialized());
    assert!(matches!(
        forensics::initialize(config(&reports)),
        Err(InitError::AlreadyInitialized)
    ));

    forensics::set_attribute("build", Some("1234"));
    forensics::set_attribute("user", Some("alice"));
    forensics::set_attribute("user", None);
    forensics::add_breadcrumb("request", &[("path", "/")]);
    forensics::add_breadcrumb("request", &[("path", "/")]);
    {
        forensics_context!("serve");
        let hits = 0;
        assert!(!forensics_verify!(hits > 0, "cold cache: {} hits", hits));
    }

    std::thread::spawn(|| {
        let _guard = forensics::context("worker");
        forensics_assert!(1 + 1 == 3);
    })
    .join()
    .unwrap();

    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);

        let verify = &reports[0];
        assert!(!verify.fatal);
        assert_eq!(verify.formatted, "cold cache: 0 hits");
        assert_eq!(verify.contexts, ["serve"]);
        assert_eq!(verify.attribute("build"), Some("1234"));
        assert_eq!(verify.attribute("user"), None);
        assert_eq!(verify.breadcrumbs.len(), 1);
        assert_eq!(verify.breadcrumbs[0].count, 2);
        assert!(verify.id.starts_with("serve-global_runtime.rs-"));
        assert!(verify.id.ends_with("-cold cache: {} hits"));
        assert!(verify.backtrace.len() <= 8);

        let assert = &reports[1];
        assert!(assert.fatal);
        assert_eq!(assert.contexts, ["worker"]);
        assert_eq!(assert.expression, "1 + 1 == 3");
        assert!(assert.id.starts_with("worker-global_runtime.rs-"));
    }

    forensics::shutdown();
    assert!(!forensics::is_initialized());

    // no-ops without a runtime
    forensics::set_attribute("build", Some("5678"));
    forensics::add_breadcrumb("ignored", &[]);
    forensics::begin_context("ignored");
    forensics::end_context();
    forensics::shutdown();
    assert_eq!(reports.lock().unwrap().len(), 2);

    // a fresh runtime starts empty
    forensics::initialize(config(&reports)).unwrap();
    forensics_verify!(false);
    {
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 3);
        assert!(reports[2].attributes.is_empty());
        assert!(reports[2].breadcrumbs.is_empty());
        assert!(reports[2].contexts.is_empty());
        assert!(reports[2].id.starts_with("<none>-"));
    }
    forensics::shutdown();
}
