//! Delivery of approved reports
//!
//! The [`DispatchCoordinator`] drains the approved queue in batches. Every
//! sender eligible for the run gets each report, even after another sender
//! failed. Foreground runs use the senders that require the foreground;
//! background runs use all the others.
//!
//! ## Flow
//!
//! ```text
//! approved/ (oldest first) ─► [silent filter] ─► take(batch_limit)
//!      │
//!      ▼  per report
//!  sender 1 ─► sender 2 ─► ... ─► sender N      (registration order)
//!      │
//!      ├─ no failures           ─► delete (sent)
//!      └─ some failures ─► RetryPolicy
//!                            ├─ true  ─► keep for next send_all
//!                            └─ false ─► delete (given up)
//! ```

pub mod http;
pub mod retry;
pub mod scheduler;

pub use http::HttpSender;
pub use retry::RetryPolicy;
pub use scheduler::{RuntimeScheduler, Scheduler};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{ReportFile, ReportStore};
use crate::types::Report;
use async_trait::async_trait;
use std::sync::Arc;

// ============================================
// Sender trait
// ============================================

/// A delivery channel for reports.
#[async_trait]
pub trait ReportSender: Send + Sync {
    /// Name used in logs and in [`FailedSender`]
    fn name(&self) -> &str;

    /// Deliver one report.
    async fn send(&self, report: &Report) -> Result<()>;

    /// Whether this sender needs the host to be in the foreground
    /// (for example because it opens a UI).
    fn requires_foreground(&self) -> bool {
        false
    }
}

/// A sender that failed to deliver one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSender {
    pub sender_name: String,
    pub error: String,
}

/// Counts from one `send_all` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    /// Reports handed to the senders
    pub attempted: usize,
    /// Reports delivered by every sender and deleted
    pub sent: usize,
    /// Reports kept for the next run
    pub retained: usize,
    /// Reports deleted without full delivery (given up or unparseable)
    pub discarded: usize,
}

// ============================================
// Coordinator
// ============================================

/// Sends approved reports through every registered sender.
pub struct DispatchCoordinator {
    store: ReportStore,
    senders: Vec<Arc<dyn ReportSender>>,
    retry_policy: Arc<dyn RetryPolicy>,
    batch_limit: usize,
    suppressed: bool,
    running: tokio::sync::Mutex<()>,
}

impl DispatchCoordinator {
    /// Create a coordinator with no senders and the configured retry policy.
    pub fn new(store: ReportStore, config: &Config) -> Self {
        Self {
            store,
            senders: Vec::new(),
            retry_policy: retry::from_config(&config.sending),
            batch_limit: config.sending.batch_limit,
            suppressed: config.reporter.sending_suppressed(),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a sender. Senders run in registration order.
    pub fn register(&mut self, sender: Arc<dyn ReportSender>) {
        tracing::debug!(
            sender = sender.name(),
            foreground = sender.requires_foreground(),
            "Registered report sender"
        );
        self.senders.push(sender);
    }

    /// Replace the retry policy.
    pub fn set_retry_policy(&mut self, policy: Arc<dyn RetryPolicy>) {
        self.retry_policy = policy;
    }

    /// Get list of registered sender names.
    pub fn sender_names(&self) -> Vec<&str> {
        self.senders.iter().map(|s| s.name()).collect()
    }

    /// Send up to `batch_limit` approved reports, oldest first.
    ///
    /// With `foreground_only` the run uses the senders that require the
    /// foreground, otherwise the ones that don't. `only_silent` restricts the
    /// run to silent reports. Concurrent
    /// calls are serialized. Only failures to list the approved queue are
    /// returned as errors; sender failures go through the retry policy.
    pub async fn send_all(&self, foreground_only: bool, only_silent: bool) -> Result<SendSummary> {
        if self.suppressed {
            tracing::info!("Sending suppressed in dev mode");
            return Ok(SendSummary::default());
        }

        let _running = self.running.lock().await;

        let senders: Vec<Arc<dyn ReportSender>> = self
            .senders
            .iter()
            .filter(|s| s.requires_foreground() == foreground_only)
            .cloned()
            .collect();
        if senders.is_empty() {
            tracing::warn!(foreground_only, "No report senders available; reports kept");
            return Ok(SendSummary::default());
        }

        let batch: Vec<ReportFile> = self
            .store
            .list_approved()?
            .into_iter()
            .filter(|f| !only_silent || f.is_silent)
            .take(self.batch_limit)
            .collect();

        let mut summary = SendSummary::default();
        for file in &batch {
            self.send_one(file, &senders, &mut summary).await;
        }

        tracing::info!(
            attempted = summary.attempted,
            sent = summary.sent,
            retained = summary.retained,
            discarded = summary.discarded,
            "Send run complete"
        );
        Ok(summary)
    }

    async fn send_one(
        &self,
        file: &ReportFile,
        senders: &[Arc<dyn ReportSender>],
        summary: &mut SendSummary,
    ) {
        let report = match self.store.load(file) {
            Ok(report) => report,
            Err(Error::Json(e)) => {
                tracing::warn!(file = file.file_name(), error = %e, "Deleting unparseable report");
                self.delete(file);
                summary.discarded += 1;
                return;
            }
            Err(e) => {
                tracing::warn!(file = file.file_name(), error = %e, "Could not read report; keeping it");
                summary.retained += 1;
                return;
            }
        };

        summary.attempted += 1;
        let failed = run_senders(senders, &report).await;

        if failed.is_empty() {
            tracing::info!(file = file.file_name(), "Report sent");
            self.delete(file);
            summary.sent += 1;
        } else if self.retry_policy.should_retry(senders, &failed) {
            tracing::info!(
                file = file.file_name(),
                failed = failed.len(),
                "Send failed; keeping report for retry"
            );
            summary.retained += 1;
        } else {
            tracing::warn!(
                file = file.file_name(),
                failed = failed.len(),
                "Send failed; giving up on report"
            );
            self.delete(file);
            summary.discarded += 1;
        }
    }

    fn delete(&self, file: &ReportFile) {
        if let Err(e) = self.store.delete(file) {
            tracing::warn!(file = file.file_name(), error = %e, "Failed to delete report");
        }
    }
}

/// Run every sender in order; a panicking sender counts as failed.
async fn run_senders(senders: &[Arc<dyn ReportSender>], report: &Report) -> Vec<FailedSender> {
    let mut failed = Vec::new();

    for sender in senders {
        let task_sender = Arc::clone(sender);
        let task_report = report.clone();
        let joined =
            tokio::spawn(async move { task_sender.send(&task_report).await }).await;

        let error = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(e) => format!("sender task failed: {}", e),
        };

        tracing::warn!(sender = sender.name(), error = %error, "Report sender failed");
        failed.push(FailedSender {
            sender_name: sender.name().to_string(),
            error,
        });
    }

    failed
}
