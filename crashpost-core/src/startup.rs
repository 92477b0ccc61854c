//! Startup reconciliation
//!
//! Reports left on disk by a previous run are cleaned up once per process
//! start, after a short delay so host initialization finishes first:
//!
//! 1. Gather pending and approved reports, noting each file's modification
//!    time. Files created or modified after the process started belong to a
//!    failure being handled right now and are left alone. The start instant
//!    is taken when reconciliation is scheduled, not when the delay ends.
//! 2. Run every [`StartupProcessor`]. Processors mark reports for approval
//!    or deletion.
//! 3. Apply the marks: deletions through the store, approvals through the
//!    [`ApprovalGate`]. A report that cannot be deleted or approved is left
//!    as it is until the next start.
//! 4. If sending is enabled and approved reports remain, ask the
//!    [`Scheduler`] to send, once.

use crate::approval::ApprovalGate;
use crate::config::Config;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::send::Scheduler;
use crate::store::{QueueState, ReportFile, ReportStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// One report as seen by startup processors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    pub file: ReportFile,
    /// File modification time
    pub modified: DateTime<Utc>,
    /// Move to the approved queue
    pub approve: bool,
    /// Remove from disk
    pub delete: bool,
}

impl StartupReport {
    fn new(file: ReportFile, modified: DateTime<Utc>) -> Self {
        Self {
            file,
            modified,
            approve: false,
            delete: false,
        }
    }

    /// True for reports still awaiting approval
    pub fn is_pending(&self) -> bool {
        self.file.state == QueueState::Pending
    }
}

/// A step run over leftover reports at startup.
pub trait StartupProcessor: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Inspect the reports and set their marks.
    fn process(&self, reports: &mut [StartupReport]) -> Result<()>;
}

// ============================================
// Built-in processors
// ============================================

/// Prunes pending reports that were never approved.
///
/// Only the most recently modified pending report survives: it is the one
/// most likely to be the failure that just ended the previous run.
pub struct UnapprovedStartupProcessor {
    delete_unapproved: bool,
    approve_remaining: bool,
}

impl UnapprovedStartupProcessor {
    pub fn new(delete_unapproved: bool, approve_remaining: bool) -> Self {
        Self {
            delete_unapproved,
            approve_remaining,
        }
    }
}

impl StartupProcessor for UnapprovedStartupProcessor {
    fn name(&self) -> &str {
        "unapproved"
    }

    fn process(&self, reports: &mut [StartupReport]) -> Result<()> {
        let newest = reports
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_pending() && !r.delete)
            .max_by(|(_, a), (_, b)| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| a.file.timestamp.cmp(&b.file.timestamp))
            })
            .map(|(i, _)| i);

        let Some(newest) = newest else {
            return Ok(());
        };

        if self.delete_unapproved {
            for (i, report) in reports.iter_mut().enumerate() {
                if i != newest && report.is_pending() {
                    report.delete = true;
                }
            }
        }

        if self.approve_remaining {
            reports[newest].approve = true;
        }
        Ok(())
    }
}

/// Resets the rate limiter ledger when the application version changed.
pub struct LimiterStartupProcessor {
    limiter: Arc<RateLimiter>,
    app_version: String,
}

impl LimiterStartupProcessor {
    pub fn new(limiter: Arc<RateLimiter>, app_version: impl Into<String>) -> Self {
        Self {
            limiter,
            app_version: app_version.into(),
        }
    }
}

impl StartupProcessor for LimiterStartupProcessor {
    fn name(&self) -> &str {
        "limiter"
    }

    fn process(&self, _reports: &mut [StartupReport]) -> Result<()> {
        self.limiter.reset_if_version_changed(&self.app_version)?;
        Ok(())
    }
}

/// Built-in processors configured from `config`.
pub fn create_default_processors(
    config: &Config,
    limiter: Arc<RateLimiter>,
) -> Vec<Arc<dyn StartupProcessor>> {
    let mut processors: Vec<Arc<dyn StartupProcessor>> = Vec::new();

    if config.limiter.enabled && config.limiter.reset_on_app_update {
        processors.push(Arc::new(LimiterStartupProcessor::new(
            limiter,
            config.reporter.app_version.clone(),
        )));
    }

    processors.push(Arc::new(UnapprovedStartupProcessor::new(
        config.startup.delete_unapproved_on_start,
        config.startup.approve_remaining_on_start,
    )));

    processors
}

// ============================================
// Reconciler
// ============================================

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Reports handed to processors
    pub examined: usize,
    /// Reports left alone because they appeared after the pass started
    pub skipped: usize,
    pub deleted: usize,
    pub approved: usize,
    /// Reports whose delete or approve failed; their files are untouched
    pub failed: usize,
    /// Whether the scheduler was asked to send
    pub send_scheduled: bool,
}

/// Runs startup processors over leftover reports.
pub struct StartupReconciler {
    store: ReportStore,
    gate: Arc<ApprovalGate>,
    scheduler: Arc<dyn Scheduler>,
    processors: Vec<Arc<dyn StartupProcessor>>,
    delay: Duration,
}

impl StartupReconciler {
    pub fn new(
        store: ReportStore,
        gate: Arc<ApprovalGate>,
        scheduler: Arc<dyn Scheduler>,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            gate,
            scheduler,
            processors: Vec::new(),
            delay,
        }
    }

    /// Register a processor. Processors run in registration order.
    pub fn register(&mut self, processor: Arc<dyn StartupProcessor>) {
        tracing::debug!(processor = processor.name(), "Registered startup processor");
        self.processors.push(processor);
    }

    /// Run one reconciliation pass now.
    ///
    /// `enabled` controls whether remaining approved reports trigger a send.
    pub fn reconcile(&self, enabled: bool) -> Result<ReconcileSummary> {
        self.reconcile_at(enabled, Utc::now())
    }

    /// [`StartupReconciler::reconcile`] treating `started` as the process start.
    ///
    /// A report whose file was modified, or whose name timestamp lies, after
    /// `started` is skipped.
    pub fn reconcile_at(&self, enabled: bool, started: DateTime<Utc>) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut reports = Vec::new();

        for file in self.store.list_all()? {
            let modified = match file.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    tracing::debug!(file = file.file_name(), error = %e, "Report vanished during startup");
                    continue;
                }
            };
            if modified > started || file.timestamp > started {
                summary.skipped += 1;
                continue;
            }
            reports.push(StartupReport::new(file, modified));
        }
        summary.examined = reports.len();

        for processor in &self.processors {
            if let Err(e) = processor.process(&mut reports) {
                tracing::warn!(processor = processor.name(), error = %e, "Startup processor failed");
            }
        }

        for report in &reports {
            if report.delete {
                match self.store.delete(&report.file) {
                    Ok(()) => summary.deleted += 1,
                    Err(e) => {
                        tracing::warn!(file = report.file.file_name(), error = %e, "Failed to delete leftover report");
                        summary.failed += 1;
                    }
                }
            } else if report.approve && report.is_pending() {
                match self.gate.approve(&report.file, None) {
                    Ok(_) => summary.approved += 1,
                    Err(e) => {
                        tracing::warn!(file = report.file.file_name(), error = %e, "Failed to approve leftover report");
                        summary.failed += 1;
                    }
                }
            }
        }

        if enabled && !self.store.list_approved()?.is_empty() {
            self.scheduler.schedule_send(false);
            summary.send_scheduled = true;
        }

        tracing::info!(
            examined = summary.examined,
            skipped = summary.skipped,
            deleted = summary.deleted,
            approved = summary.approved,
            failed = summary.failed,
            send_scheduled = summary.send_scheduled,
            "Startup reconciliation complete"
        );
        Ok(summary)
    }

    /// Run reconciliation on `handle` after the configured delay.
    ///
    /// The pass start is fixed now, so reports queued during the delay are
    /// left alone.
    pub fn spawn(self: Arc<Self>, handle: &Handle, enabled: bool) -> JoinHandle<()> {
        let started = Utc::now();
        handle.spawn(async move {
            tokio::time::sleep(self.delay).await;
            if let Err(e) = self.reconcile_at(enabled, started) {
                tracing::error!(error = %e, "Startup reconciliation failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendingConfig;
    use crate::types::Report;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::fs::File;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingScheduler(AtomicUsize);

    impl Scheduler for CountingScheduler {
        fn schedule_send(&self, _only_silent: bool) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn t(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + ChronoDuration::minutes(n)
    }

    fn set_modified(file: &ReportFile, at: DateTime<Utc>) {
        let handle = File::options().write(true).open(&file.path).unwrap();
        handle.set_modified(SystemTime::from(at)).unwrap();
    }

    /// Pending report whose name timestamp and mtime are independent.
    fn pending(store: &ReportStore, name_minute: i64, modified: DateTime<Utc>) -> ReportFile {
        let file = store
            .write_pending(&Report::new(t(name_minute), false))
            .unwrap();
        set_modified(&file, modified);
        file
    }

    struct Fixture {
        _dir: TempDir,
        store: ReportStore,
        scheduler: Arc<CountingScheduler>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = ReportStore::open(dir.path()).unwrap();
        Fixture {
            _dir: dir,
            store,
            scheduler: Arc::new(CountingScheduler::default()),
        }
    }

    fn reconciler(fx: &Fixture, approve_remaining: bool) -> StartupReconciler {
        let gate = Arc::new(ApprovalGate::new(fx.store.clone(), &SendingConfig::default()));
        let mut reconciler = StartupReconciler::new(
            fx.store.clone(),
            gate,
            fx.scheduler.clone(),
            Duration::ZERO,
        );
        reconciler.register(Arc::new(UnapprovedStartupProcessor::new(true, approve_remaining)));
        reconciler
    }

    #[test]
    fn test_only_most_recently_modified_pending_survives() {
        let fx = fixture();
        // Name order deliberately disagrees with modification order.
        pending(&fx.store, 0, t(30));
        let newest = pending(&fx.store, 1, t(50));
        pending(&fx.store, 2, t(40));

        let summary = reconciler(&fx, false).reconcile_at(true, t(60)).unwrap();

        assert_eq!(summary.deleted, 2);
        let remaining = fx.store.list_pending().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file_name(), newest.file_name());
        assert!(!summary.send_scheduled);
    }

    #[test]
    fn test_survivor_approved_when_configured() {
        let fx = fixture();
        pending(&fx.store, 0, t(10));
        let newest = pending(&fx.store, 1, t(20));
        pending(&fx.store, 2, t(15));

        let summary = reconciler(&fx, true).reconcile_at(true, t(60)).unwrap();

        assert_eq!(summary.approved, 1);
        assert!(fx.store.list_pending().unwrap().is_empty());
        let approved = fx.store.list_approved().unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].file_name(), newest.file_name());
        assert!(summary.send_scheduled);
        assert_eq!(fx.scheduler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reports_after_start_are_skipped() {
        let fx = fixture();
        pending(&fx.store, 0, t(10));
        pending(&fx.store, 1, t(20));
        let live = pending(&fx.store, 2, t(70));

        let summary = reconciler(&fx, false).reconcile_at(true, t(60)).unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.deleted, 1);
        let names: Vec<_> = fx
            .store
            .list_pending()
            .unwrap()
            .iter()
            .map(|f| f.file_name().to_string())
            .collect();
        assert!(names.contains(&live.file_name().to_string()));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_approved_reports_trigger_one_send() {
        let fx = fixture();
        for minute in 0..3 {
            let file = fx
                .store
                .write_pending(&Report::new(t(minute), false))
                .unwrap();
            let approved = fx.store.promote(&file).unwrap();
            set_modified(&approved, t(minute));
        }

        let summary = reconciler(&fx, false).reconcile_at(true, t(60)).unwrap();

        assert_eq!(summary.deleted, 0);
        assert_eq!(fx.store.list_approved().unwrap().len(), 3);
        assert_eq!(fx.scheduler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_does_not_schedule() {
        let fx = fixture();
        let file = fx.store.write_pending(&Report::new(t(0), false)).unwrap();
        let approved = fx.store.promote(&file).unwrap();
        set_modified(&approved, t(0));

        let summary = reconciler(&fx, false).reconcile_at(false, t(60)).unwrap();

        assert!(!summary.send_scheduled);
        assert_eq!(fx.scheduler.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_limiter_processor_resets_on_new_version() {
        let fx = fixture();
        let limiter = Arc::new(RateLimiter::new(Default::default(), fx.store.clone()));
        limiter.reset_if_version_changed("1.0.0").unwrap();
        let mut report = Report::new(t(0), false);
        report.put(crate::types::ReportField::StackTraceHash, "abc");
        limiter.record_if_allowed(&report).unwrap();
        assert_eq!(limiter.entries().len(), 1);

        let processor = LimiterStartupProcessor::new(Arc::clone(&limiter), "2.0.0");
        processor.process(&mut []).unwrap();

        assert!(limiter.entries().is_empty());
    }

    #[test]
    fn test_default_processors() {
        let fx = fixture();
        let limiter = Arc::new(RateLimiter::new(Default::default(), fx.store.clone()));
        let names: Vec<String> = create_default_processors(&Config::default(), limiter)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["limiter", "unapproved"]);
    }

    /// Promotes the oldest report behind the reconciler's back, then marks
    /// the stale handle for approval and the next report for deletion.
    struct StaleApproval {
        store: ReportStore,
    }

    impl StartupProcessor for StaleApproval {
        fn name(&self) -> &str {
            "stale_approval"
        }

        fn process(&self, reports: &mut [StartupReport]) -> Result<()> {
            self.store.promote(&reports[0].file)?;
            reports[0].approve = true;
            reports[1].delete = true;
            Ok(())
        }
    }

    #[test]
    fn test_failed_mark_does_not_stop_the_pass() {
        let fx = fixture();
        let stale = pending(&fx.store, 0, t(10));
        pending(&fx.store, 1, t(20));
        let kept = pending(&fx.store, 2, t(30));

        let gate = Arc::new(ApprovalGate::new(fx.store.clone(), &SendingConfig::default()));
        let mut reconciler =
            StartupReconciler::new(fx.store.clone(), gate, fx.scheduler.clone(), Duration::ZERO);
        reconciler.register(Arc::new(StaleApproval {
            store: fx.store.clone(),
        }));

        let summary = reconciler.reconcile_at(true, t(60)).unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.approved, 0);
        let remaining = fx.store.list_pending().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file_name(), kept.file_name());
        let approved = fx.store.list_approved().unwrap();
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].file_name(), stale.file_name());
        assert!(summary.send_scheduled);
        assert_eq!(fx.scheduler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reports_queued_during_delay_survive() {
        let fx = fixture();
        pending(&fx.store, 0, t(0));
        pending(&fx.store, 1, t(1));

        let gate = Arc::new(ApprovalGate::new(fx.store.clone(), &SendingConfig::default()));
        let mut reconciler = StartupReconciler::new(
            fx.store.clone(),
            gate,
            fx.scheduler.clone(),
            Duration::from_millis(300),
        );
        reconciler.register(Arc::new(UnapprovedStartupProcessor::new(true, false)));

        let task = Arc::new(reconciler).spawn(&Handle::current(), true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let live_a = fx.store.write_pending(&Report::new(Utc::now(), false)).unwrap();
        let live_b = fx.store.write_pending(&Report::new(Utc::now(), false)).unwrap();
        task.await.unwrap();

        let names: Vec<String> = fx
            .store
            .list_pending()
            .unwrap()
            .iter()
            .map(|f| f.file_name().to_string())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&live_a.file_name().to_string()));
        assert!(names.contains(&live_b.file_name().to_string()));
    }

    #[tokio::test]
    async fn test_spawn_runs_after_delay() {
        let fx = fixture();
        pending(&fx.store, 0, t(0));
        pending(&fx.store, 1, t(1));

        let reconciler = Arc::new(reconciler(&fx, false));
        reconciler.spawn(&Handle::current(), true).await.unwrap();

        assert_eq!(fx.store.list_pending().unwrap().len(), 1);
    }
}
