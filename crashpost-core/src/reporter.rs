//! The error reporting pipeline
//!
//! [`ErrorReporter`] wires every stage together and is owned by the host.
//! There is no global instance: construct one at startup and pass it (or an
//! `Arc` of it) to the places that report failures.
//!
//! ## Pipeline
//!
//! ```text
//! CrashContext
//!     │
//!     ▼
//! RateLimiter::may_collect ──(drop)──► DropNotifier
//!     │
//!     ▼
//! CollectionOrchestrator::collect          (tiered collectors)
//!     │
//!     ▼
//! RateLimiter::record_if_allowed ─(drop)─► DropNotifier
//!     │
//!     ▼
//! ReportStore::write_pending ─► ApprovalGate ─► Scheduler ─► DispatchCoordinator
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use crashpost_core::{Config, CrashContext, ErrorReporter};
//! use std::sync::Arc;
//!
//! let reporter = Arc::new(ErrorReporter::new(Config::load()?)?);
//! reporter.start();
//! crashpost_core::panic::install_panic_hook(Arc::clone(&reporter));
//!
//! let outcome = reporter.handle_blocking(
//!     CrashContext::new().with_message("database unavailable").silent(),
//!     std::time::Duration::from_secs(5),
//! )?;
//! println!("{:?}", outcome);
//! # Ok::<(), crashpost_core::Error>(())
//! ```

use crate::approval::{ApprovalCollaborator, ApprovalGate, UserComment};
use crate::collect::collectors::{create_default_orchestrator, SharedCustomData};
use crate::collect::{CollectionOrchestrator, FieldCollector};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::{DropNotifier, DropReason, LimitDecision, LogDropNotifier, RateLimiter};
use crate::send::{
    DispatchCoordinator, HttpSender, ReportSender, RetryPolicy, RuntimeScheduler, Scheduler,
    SendSummary,
};
use crate::startup::{
    create_default_processors, ReconcileSummary, StartupProcessor, StartupReconciler,
};
use crate::store::{ReportFile, ReportStore};
use crate::types::CrashContext;
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;

/// Worker threads of the reporter's own runtime
const RUNTIME_WORKERS: usize = 2;

/// Name of every thread owned by the reporter's runtime
pub(crate) const RUNTIME_THREAD_NAME: &str = "crashpost-worker";

/// What happened to one reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Reporting is disabled in configuration
    Disabled,
    /// A rate limit rejected the report
    Dropped(DropReason),
    /// Written to the pending queue, waiting for approval
    Queued(ReportFile),
    /// Approved and scheduled for sending
    Approved(ReportFile),
}

// ============================================
// Builder
// ============================================

/// Assembles an [`ErrorReporter`] with host-provided parts.
pub struct ErrorReporterBuilder {
    config: Config,
    report_dir: Option<PathBuf>,
    collectors: Vec<Arc<dyn FieldCollector>>,
    senders: Vec<Arc<dyn ReportSender>>,
    collaborators: Vec<Arc<dyn ApprovalCollaborator>>,
    processors: Vec<Arc<dyn StartupProcessor>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    notifier: Option<Arc<dyn DropNotifier>>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl ErrorReporterBuilder {
    /// Store reports under `dir` instead of the configured directory.
    pub fn report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    /// Add a field collector after the built-ins.
    pub fn collector(mut self, collector: Arc<dyn FieldCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Add a report sender.
    pub fn sender(mut self, sender: Arc<dyn ReportSender>) -> Self {
        self.senders.push(sender);
        self
    }

    /// Add an approval collaborator.
    pub fn approval(mut self, collaborator: Arc<dyn ApprovalCollaborator>) -> Self {
        self.collaborators.push(collaborator);
        self
    }

    /// Add a startup processor after the built-ins.
    pub fn startup_processor(mut self, processor: Arc<dyn StartupProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Override the configured retry policy.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Override the logging drop notifier.
    pub fn drop_notifier(mut self, notifier: Arc<dyn DropNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Override the runtime scheduler (e.g. with an OS job scheduler).
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Build the pipeline, creating the report directories if needed.
    pub fn build(self) -> Result<ErrorReporter> {
        self.config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKERS)
            .thread_name(RUNTIME_THREAD_NAME)
            .enable_all()
            .build()
            .map_err(|e| Error::Runtime(format!("failed to create runtime: {}", e)))?;

        let report_dir = self.report_dir.unwrap_or_else(|| self.config.report_dir());
        let store = ReportStore::open(&report_dir)?;
        let limiter = Arc::new(RateLimiter::new(self.config.limiter.clone(), store.clone()));
        let custom_data = SharedCustomData::default();

        let mut orchestrator =
            create_default_orchestrator(&self.config, custom_data.clone(), Utc::now());
        for collector in self.collectors {
            orchestrator.register(collector);
        }

        let mut gate = ApprovalGate::new(store.clone(), &self.config.sending);
        for collaborator in self.collaborators {
            gate.register(collaborator);
        }
        let gate = Arc::new(gate);

        let mut coordinator = DispatchCoordinator::new(store.clone(), &self.config);
        if self.config.http.is_ready() {
            coordinator.register(Arc::new(HttpSender::new(&self.config.http)?));
        }
        for sender in self.senders {
            coordinator.register(sender);
        }
        if let Some(policy) = self.retry_policy {
            coordinator.set_retry_policy(policy);
        }
        let coordinator = Arc::new(coordinator);

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(RuntimeScheduler::new(
                runtime.handle().clone(),
                Arc::clone(&coordinator),
            )),
        };
        let notifier: Arc<dyn DropNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(LogDropNotifier),
        };

        let mut reconciler = StartupReconciler::new(
            store.clone(),
            Arc::clone(&gate),
            Arc::clone(&scheduler),
            Duration::from_millis(self.config.startup.delay_ms),
        );
        for processor in create_default_processors(&self.config, Arc::clone(&limiter)) {
            reconciler.register(processor);
        }
        for processor in self.processors {
            reconciler.register(processor);
        }

        tracing::info!(
            report_dir = %report_dir.display(),
            collectors = orchestrator.collector_names().len(),
            senders = coordinator.sender_names().len(),
            "Error reporter ready"
        );

        Ok(ErrorReporter {
            config: self.config,
            store,
            limiter,
            orchestrator,
            gate,
            coordinator,
            scheduler,
            reconciler: Arc::new(reconciler),
            notifier,
            custom_data,
            runtime: Some(runtime),
        })
    }
}

// ============================================
// Reporter
// ============================================

/// Host-owned error reporting pipeline.
pub struct ErrorReporter {
    config: Config,
    store: ReportStore,
    limiter: Arc<RateLimiter>,
    orchestrator: CollectionOrchestrator,
    gate: Arc<ApprovalGate>,
    coordinator: Arc<DispatchCoordinator>,
    scheduler: Arc<dyn Scheduler>,
    reconciler: Arc<StartupReconciler>,
    notifier: Arc<dyn DropNotifier>,
    custom_data: SharedCustomData,
    runtime: Option<Runtime>,
}

impl ErrorReporter {
    /// Build a reporter with the built-in parts only.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start assembling a reporter with custom parts.
    pub fn builder(config: Config) -> ErrorReporterBuilder {
        ErrorReporterBuilder {
            config,
            report_dir: None,
            collectors: Vec::new(),
            senders: Vec::new(),
            collaborators: Vec::new(),
            processors: Vec::new(),
            retry_policy: None,
            notifier: None,
            scheduler: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn coordinator(&self) -> &DispatchCoordinator {
        &self.coordinator
    }

    /// Handle of the reporter's own runtime.
    pub fn runtime_handle(&self) -> Result<&Handle> {
        self.runtime
            .as_ref()
            .map(|r| r.handle())
            .ok_or_else(|| Error::Runtime("reporter runtime is shut down".to_string()))
    }

    /// Run a future to completion on the reporter's runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| Error::Runtime("reporter runtime is shut down".to_string()))?;
        Ok(runtime.block_on(future))
    }

    // ============================================
    // Reporting
    // ============================================

    /// Run a failure through the whole pipeline.
    pub async fn handle(&self, ctx: CrashContext) -> Result<ReportOutcome> {
        if !self.config.reporter.enabled {
            return Ok(ReportOutcome::Disabled);
        }

        let ctx = Arc::new(ctx);
        if let LimitDecision::Drop(reason) = self.limiter.check_collect_at(&ctx, Utc::now()) {
            self.notifier.report_dropped(&ctx, &reason);
            return Ok(ReportOutcome::Dropped(reason));
        }

        let report = self.orchestrator.collect(Arc::clone(&ctx)).await;

        match self.limiter.record_if_allowed(&report) {
            Ok(LimitDecision::Allow) => {}
            Ok(LimitDecision::Drop(reason)) => {
                self.notifier.report_dropped(&ctx, &reason);
                return Ok(ReportOutcome::Dropped(reason));
            }
            // The report is still worth keeping when only the ledger write failed.
            Err(e) => tracing::warn!(error = %e, "Failed to persist limiter ledger"),
        }

        let file = self.store.write_pending(&report)?;
        tracing::info!(
            file = file.file_name(),
            silent = file.is_silent,
            uncaught = ctx.is_uncaught,
            "Report queued"
        );

        let outcome = self.gate.run(&file, &report).await?;
        if outcome.is_approved() {
            self.scheduler.schedule_send(false);
            return Ok(ReportOutcome::Approved(outcome.file().clone()));
        }
        Ok(ReportOutcome::Queued(outcome.file().clone()))
    }

    /// Report from synchronous code, waiting at most `timeout`.
    ///
    /// Safe to call from any thread, including a panic hook or a worker of
    /// another runtime: the pipeline runs on the reporter's own runtime.
    pub fn handle_blocking(self: &Arc<Self>, ctx: CrashContext, timeout: Duration) -> Result<ReportOutcome> {
        let (tx, rx) = mpsc::channel();
        let reporter = Arc::clone(self);
        self.runtime_handle()?.spawn(async move {
            let _ = tx.send(reporter.handle(ctx).await);
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Runtime(format!(
                "report handling exceeded {} ms",
                timeout.as_millis()
            ))),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Runtime("report handling task aborted".to_string()))
            }
        }
    }

    // ============================================
    // Custom data
    // ============================================

    /// Attach a key/value to every future report. Returns the previous value.
    pub fn put_custom_data(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let mut data = self
            .custom_data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        data.insert(key.into(), value.into())
    }

    /// Remove a custom key. Returns the removed value.
    pub fn remove_custom_data(&self, key: &str) -> Option<String> {
        let mut data = self
            .custom_data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        data.remove(key)
    }

    /// Remove all custom data.
    pub fn clear_custom_data(&self) {
        self.custom_data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    // ============================================
    // Queue management
    // ============================================

    /// Approve a pending report by file name and schedule a send.
    pub fn approve_pending(&self, name: &str, comment: Option<UserComment>) -> Result<ReportFile> {
        let file = self.find_pending(name)?;
        let approved = self.gate.approve(&file, comment)?;
        self.scheduler.schedule_send(false);
        Ok(approved)
    }

    /// Delete a pending report by file name.
    pub fn discard_pending(&self, name: &str) -> Result<()> {
        let file = self.find_pending(name)?;
        self.gate.discard(&file)
    }

    /// Send approved reports now, honoring the batch limit.
    pub async fn send_now(&self, only_silent: bool) -> Result<SendSummary> {
        self.coordinator.send_all(false, only_silent).await
    }

    /// Run startup reconciliation now.
    pub fn reconcile_now(&self) -> Result<ReconcileSummary> {
        self.reconciler.reconcile(self.sending_enabled())
    }

    /// Schedule startup reconciliation after the configured delay.
    ///
    /// Call once per process start.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        match self.runtime_handle() {
            Ok(handle) => Some(Arc::clone(&self.reconciler).spawn(handle, self.sending_enabled())),
            Err(e) => {
                tracing::error!(error = %e, "Cannot start reconciliation");
                None
            }
        }
    }

    fn sending_enabled(&self) -> bool {
        self.config.reporter.enabled && !self.config.reporter.sending_suppressed()
    }

    fn find_pending(&self, name: &str) -> Result<ReportFile> {
        self.store
            .list_pending()?
            .into_iter()
            .find(|f| f.file_name() == name)
            .ok_or_else(|| Error::Store(format!("no pending report named {}", name)))
    }
}

impl Drop for ErrorReporter {
    fn drop(&mut self) {
        // Dropping a runtime blocks; this may run inside an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReportField;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingScheduler(AtomicUsize);

    impl Scheduler for CountingScheduler {
        fn schedule_send(&self, _only_silent: bool) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<DropReason>>);

    impl DropNotifier for RecordingNotifier {
        fn report_dropped(&self, _ctx: &CrashContext, reason: &DropReason) {
            self.0.lock().unwrap().push(reason.clone());
        }
    }

    struct Defer;

    #[async_trait]
    impl ApprovalCollaborator for Defer {
        fn name(&self) -> &str {
            "dialog"
        }

        async fn request_approval(&self, _file: &ReportFile, _report: &crate::types::Report) -> bool {
            false
        }
    }

    fn failure(n: usize) -> CrashContext {
        CrashContext::new()
            .with_message("boom")
            .with_exception(format!("app::Error{}", n), format!("app::Error{}\n  at app::run", n))
    }

    #[test]
    fn test_handle_approves_and_schedules() {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(CountingScheduler::default());
        let reporter = ErrorReporter::builder(Config::default())
            .report_dir(dir.path())
            .scheduler(scheduler.clone())
            .build()
            .unwrap();

        let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();

        assert!(matches!(outcome, ReportOutcome::Approved(_)));
        assert_eq!(reporter.store().list_approved().unwrap().len(), 1);
        assert_eq!(scheduler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_defers_to_collaborator() {
        let dir = TempDir::new().unwrap();
        let reporter = ErrorReporter::builder(Config::default())
            .report_dir(dir.path())
            .approval(Arc::new(Defer))
            .scheduler(Arc::new(CountingScheduler::default()))
            .build()
            .unwrap();

        let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
        let ReportOutcome::Queued(file) = outcome else {
            panic!("expected queued report, got {:?}", outcome);
        };

        let approved = reporter
            .approve_pending(
                file.file_name(),
                Some(UserComment {
                    comment: Some("clicked save".to_string()),
                    email: None,
                }),
            )
            .unwrap();
        let report = reporter.store().load(&approved).unwrap();
        assert_eq!(report.get_str(ReportField::UserComment), Some("clicked save"));
    }

    #[test]
    fn test_disabled_reporter() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.reporter.enabled = false;
        let reporter = ErrorReporter::builder(config)
            .report_dir(dir.path())
            .build()
            .unwrap();

        let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
        assert_eq!(outcome, ReportOutcome::Disabled);
        assert!(reporter.store().list_all().unwrap().is_empty());
    }

    #[test]
    fn test_stacktrace_limit_drops_and_notifies() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = Config::default();
        config.limiter.stacktrace_limit = 1;
        let reporter = ErrorReporter::builder(config)
            .report_dir(dir.path())
            .scheduler(Arc::new(CountingScheduler::default()))
            .drop_notifier(notifier.clone())
            .build()
            .unwrap();

        let first = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
        let second = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();

        assert!(matches!(first, ReportOutcome::Approved(_)));
        assert!(matches!(
            second,
            ReportOutcome::Dropped(DropReason::StacktraceLimit { .. })
        ));
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
        assert_eq!(reporter.store().list_approved().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_report_limit_stops_collection() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.limiter.failed_report_limit = 2;
        let reporter = ErrorReporter::builder(config)
            .report_dir(dir.path())
            .scheduler(Arc::new(CountingScheduler::default()))
            .build()
            .unwrap();

        for n in 0..2 {
            reporter.block_on(reporter.handle(failure(n))).unwrap().unwrap();
        }
        let third = reporter.block_on(reporter.handle(failure(3))).unwrap().unwrap();

        assert!(matches!(
            third,
            ReportOutcome::Dropped(DropReason::FailedReportLimit { queued: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_custom_data_reaches_report() {
        let dir = TempDir::new().unwrap();
        let reporter = ErrorReporter::builder(Config::default())
            .report_dir(dir.path())
            .scheduler(Arc::new(CountingScheduler::default()))
            .build()
            .unwrap();

        assert_eq!(reporter.put_custom_data("tenant", "acme"), None);
        reporter.put_custom_data("stale", "x");
        assert_eq!(reporter.remove_custom_data("stale").as_deref(), Some("x"));

        let outcome = reporter.block_on(reporter.handle(failure(1))).unwrap().unwrap();
        let ReportOutcome::Approved(file) = outcome else {
            panic!("expected approved report");
        };
        let report = reporter.store().load(&file).unwrap();
        let custom = report.get(ReportField::CustomData.as_str()).unwrap();
        assert_eq!(custom["tenant"], "acme");
        assert!(custom.get("stale").is_none());

        reporter.clear_custom_data();
        assert_eq!(reporter.remove_custom_data("tenant"), None);
    }

    #[test]
    fn test_handle_blocking_from_plain_thread() {
        let dir = TempDir::new().unwrap();
        let reporter = Arc::new(
            ErrorReporter::builder(Config::default())
                .report_dir(dir.path())
                .scheduler(Arc::new(CountingScheduler::default()))
                .build()
                .unwrap(),
        );

        let worker = Arc::clone(&reporter);
        let outcome = std::thread::spawn(move || {
            worker.handle_blocking(failure(1).silent(), Duration::from_secs(10))
        })
        .join()
        .unwrap()
        .unwrap();

        let ReportOutcome::Approved(file) = outcome else {
            panic!("expected approved report");
        };
        assert!(file.is_silent);
    }

    #[test]
    fn test_discard_pending_unknown_name() {
        let dir = TempDir::new().unwrap();
        let reporter = ErrorReporter::builder(Config::default())
            .report_dir(dir.path())
            .build()
            .unwrap();

        assert!(matches!(
            reporter.discard_pending("missing.report"),
            Err(Error::Store(_))
        ));
    }
}
