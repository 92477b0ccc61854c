//! Integration tests for the crashpost pipeline
//!
//! These tests build a full [`ErrorReporter`] over a temporary report
//! directory and drive failures from collection through delivery.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use crashpost_core::config::RetryPolicyKind;
use crashpost_core::{
    ApprovalCollaborator, CollectorOrder, Config, CrashContext, Error, ErrorReporter,
    FieldCollector, Report, ReportField, ReportFile, ReportOutcome, ReportSender, ReportStore,
    Result,
};
use serde_json::{json, Value};
use std::fs::File;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tempfile::TempDir;

// ============================================
// Test doubles
// ============================================

/// Writes a fixed value under a shared key.
struct Tagged {
    name: &'static str,
    order: CollectorOrder,
}

impl FieldCollector for Tagged {
    fn name(&self) -> &str {
        self.name
    }

    fn order(&self) -> CollectorOrder {
        self.order
    }

    fn collect(&self, _ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        Ok(vec![("WRITER".to_string(), json!(self.name))])
    }
}

struct AlwaysFails;

impl FieldCollector for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::First
    }

    fn collect(&self, _ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        Err(Error::collector("always_fails", "device not ready"))
    }
}

/// Records the timestamp of every report it is asked to send.
struct Recording {
    name: &'static str,
    fail: bool,
    seen: Mutex<Vec<String>>,
}

impl Recording {
    fn new(name: &'static str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            fail,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ReportSender for Recording {
    fn name(&self) -> &str {
        self.name
    }

    async fn send(&self, report: &Report) -> Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push(report.timestamp.to_rfc3339());
        if self.fail {
            Err(Error::sender(self.name, "503 Service Unavailable"))
        } else {
            Ok(())
        }
    }
}

/// Leaves every report waiting for the user.
struct Defer;

#[async_trait]
impl ApprovalCollaborator for Defer {
    fn name(&self) -> &str {
        "defer"
    }

    async fn request_approval(&self, _file: &ReportFile, _report: &Report) -> bool {
        false
    }
}

/// Scheduler that ignores requests so tests control when sending happens.
struct ManualScheduler;

impl crashpost_core::Scheduler for ManualScheduler {
    fn schedule_send(&self, _only_silent: bool) {}
}

fn config() -> Config {
    let mut config = Config::default();
    config.startup.delay_ms = 0;
    config
}

fn failure(n: usize) -> CrashContext {
    CrashContext::new()
        .with_message(format!("failure {}", n))
        .with_exception(
            format!("app::Error{}", n),
            format!("app::Error{}: failure\n  0: app::step{}", n, n),
        )
}

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 4, 8, 0, 0).unwrap() + Duration::minutes(minute)
}

fn approved_at(store: &ReportStore, minute: i64) -> ReportFile {
    let file = store.write_pending(&Report::new(t(minute), false)).unwrap();
    store.promote(&file).unwrap()
}

// ============================================
// Collection
// ============================================

#[test]
fn test_later_tier_overwrites_earlier_field() {
    let dir = TempDir::new().unwrap();
    let reporter = ErrorReporter::builder(config())
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .collector(Arc::new(Tagged {
            name: "late",
            order: CollectorOrder::Late,
        }))
        .collector(Arc::new(Tagged {
            name: "first",
            order: CollectorOrder::First,
        }))
        .collector(Arc::new(Tagged {
            name: "normal",
            order: CollectorOrder::Normal,
        }))
        .build()
        .unwrap();

    let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
    let ReportOutcome::Approved(file) = outcome else {
        panic!("expected approved report, got {:?}", outcome);
    };

    let report = reporter.store().load(&file).unwrap();
    assert_eq!(report.get("WRITER"), Some(&json!("late")));
}

#[test]
fn test_failing_collector_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    let reporter = ErrorReporter::builder(config())
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .collector(Arc::new(AlwaysFails))
        .collector(Arc::new(Tagged {
            name: "last",
            order: CollectorOrder::Last,
        }))
        .build()
        .unwrap();

    let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
    let ReportOutcome::Approved(file) = outcome else {
        panic!("expected approved report, got {:?}", outcome);
    };

    let report = reporter.store().load(&file).unwrap();
    assert_eq!(report.get("WRITER"), Some(&json!("last")));
    assert_eq!(report.get_str(ReportField::Message), Some("failure 1"));
    assert_eq!(report.get_str(ReportField::ExceptionClass), Some("app::Error1"));
}

// ============================================
// Queue
// ============================================

#[test]
fn test_promoted_report_is_in_exactly_one_queue() {
    let dir = TempDir::new().unwrap();
    let store = ReportStore::open(dir.path()).unwrap();
    let pending = store.write_pending(&Report::new(t(0), true)).unwrap();
    let approved = store.promote(&pending).unwrap();

    let in_pending = store
        .list_pending()
        .unwrap()
        .iter()
        .any(|f| f.file_name() == pending.file_name());
    let in_approved = store
        .list_approved()
        .unwrap()
        .iter()
        .any(|f| f.file_name() == approved.file_name());

    assert!(!in_pending);
    assert!(in_approved);
    assert!(approved.file_name().ends_with("-silent.report"));
}

// ============================================
// Sending
// ============================================

#[test]
fn test_partial_failure_keeps_report_when_retrying_unless_all_failed() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.sending.retry_policy = RetryPolicyKind::RetryUnlessAllFailed;
    let a = Recording::new("a", false);
    let b = Recording::new("b", true);
    let reporter = ErrorReporter::builder(config)
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .sender(a.clone())
        .sender(b.clone())
        .build()
        .unwrap();
    approved_at(reporter.store(), 0);

    let summary = reporter.block_on(reporter.send_now(false)).unwrap().unwrap();

    assert_eq!(summary.retained, 1);
    assert_eq!(reporter.store().list_approved().unwrap().len(), 1);
    assert_eq!((a.count(), b.count()), (1, 1));
}

#[test]
fn test_all_failed_deletes_report_when_retrying_unless_all_failed() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.sending.retry_policy = RetryPolicyKind::RetryUnlessAllFailed;
    let reporter = ErrorReporter::builder(config)
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .sender(Recording::new("a", true))
        .sender(Recording::new("b", true))
        .build()
        .unwrap();
    approved_at(reporter.store(), 0);

    let summary = reporter.block_on(reporter.send_now(false)).unwrap().unwrap();

    assert_eq!(summary.discarded, 1);
    assert!(reporter.store().list_approved().unwrap().is_empty());
}

#[test]
fn test_batch_cap_sends_five_oldest_per_call() {
    let dir = TempDir::new().unwrap();
    let sender = Recording::new("a", false);
    let reporter = ErrorReporter::builder(config())
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .sender(sender.clone())
        .build()
        .unwrap();
    for minute in [7, 2, 9, 0, 4, 1, 8, 3, 6, 5] {
        approved_at(reporter.store(), minute);
    }

    let first = reporter.block_on(reporter.send_now(false)).unwrap().unwrap();
    assert_eq!(first.attempted, 5);
    let remaining: Vec<DateTime<Utc>> = reporter
        .store()
        .list_approved()
        .unwrap()
        .iter()
        .map(|f| f.timestamp)
        .collect();
    assert_eq!(remaining, (5..10).map(t).collect::<Vec<_>>());

    let second = reporter.block_on(reporter.send_now(false)).unwrap().unwrap();
    assert_eq!(second.attempted, 5);
    assert!(reporter.store().list_approved().unwrap().is_empty());
    assert_eq!(sender.count(), 10);
}

#[test]
fn test_scheduled_send_delivers_new_report() {
    let dir = TempDir::new().unwrap();
    let sender = Recording::new("a", false);
    let reporter = ErrorReporter::builder(config())
        .report_dir(dir.path())
        .sender(sender.clone())
        .build()
        .unwrap();

    reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();

    // The runtime scheduler sends in the background.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while sender.count() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert_eq!(sender.count(), 1);
}

// ============================================
// Startup
// ============================================

#[test]
fn test_startup_keeps_most_recently_modified_pending_report() {
    let dir = TempDir::new().unwrap();
    let reporter = ErrorReporter::builder(config())
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .build()
        .unwrap();
    let store = reporter.store();

    let (t1, t2, t3) = (t(10), t(20), t(30));
    let mut newest = None;
    for (minute, modified) in [(0, t2), (1, t3), (2, t1)] {
        let file = store.write_pending(&Report::new(t(minute), false)).unwrap();
        File::options()
            .write(true)
            .open(&file.path)
            .unwrap()
            .set_modified(SystemTime::from(modified))
            .unwrap();
        if modified == t3 {
            newest = Some(file);
        }
    }

    let summary = reporter.reconcile_now().unwrap();

    assert_eq!(summary.deleted, 2);
    let pending = store.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].file_name(), newest.unwrap().file_name());
}

#[test]
fn test_reports_handled_during_startup_delay_are_kept() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.startup.delay_ms = 500;
    let reporter = ErrorReporter::builder(config)
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .approval(Arc::new(Defer))
        .build()
        .unwrap();

    for minute in 0..2 {
        let leftover = reporter
            .store()
            .write_pending(&Report::new(t(minute), false))
            .unwrap();
        File::options()
            .write(true)
            .open(&leftover.path)
            .unwrap()
            .set_modified(SystemTime::from(t(minute)))
            .unwrap();
    }

    let startup = reporter.start().unwrap();
    let mut live = Vec::new();
    for n in 1..=2 {
        let outcome = reporter.block_on(reporter.handle(failure(n))).unwrap().unwrap();
        let ReportOutcome::Queued(file) = outcome else {
            panic!("expected deferred report, got {:?}", outcome);
        };
        live.push(file.file_name().to_string());
    }
    assert_eq!(reporter.store().list_pending().unwrap().len(), 4);

    reporter.block_on(startup).unwrap().unwrap();

    let remaining: Vec<String> = reporter
        .store()
        .list_pending()
        .unwrap()
        .iter()
        .map(|f| f.file_name().to_string())
        .collect();
    assert_eq!(remaining.len(), 3);
    for name in &live {
        assert!(remaining.contains(name), "{name} was pruned");
    }
}

#[test]
fn test_limiter_ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.limiter.stacktrace_limit = 1;

    {
        let reporter = ErrorReporter::builder(config.clone())
            .report_dir(dir.path())
            .scheduler(Arc::new(ManualScheduler))
            .build()
            .unwrap();
        let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
        assert!(matches!(outcome, ReportOutcome::Approved(_)));
    }

    let reporter = ErrorReporter::builder(config)
        .report_dir(dir.path())
        .scheduler(Arc::new(ManualScheduler))
        .build()
        .unwrap();
    let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
    assert!(matches!(outcome, ReportOutcome::Dropped(_)));
}
