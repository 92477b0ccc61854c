//! Field collection framework
//!
//! Collectors turn a [`CrashContext`] into report fields. The orchestrator
//! runs them tier by tier and merges their output into a single [`Report`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   COLLECTION ORCHESTRATOR                       │
//! │                                                                 │
//! │  FIRST   ─► [stacktrace] [simple_values]      (concurrent)      │
//! │  EARLY   ─► [time]                                              │
//! │  NORMAL  ─► [thread] [environment]                              │
//! │  LATE    ─► [custom_data]                                       │
//! │  LAST    ─► [log_file]                                          │
//! │                                                                 │
//! │  - each tier completes (or times out) before the next starts    │
//! │  - failures, panics and timeouts drop that collector's fields   │
//! │  - merge order: tier order, then registration order             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crashpost_core::collect::collectors::create_default_orchestrator;
//!
//! let orchestrator = create_default_orchestrator(&config, custom_data, started_at);
//! let report = orchestrator.collect(Arc::new(ctx)).await;
//! ```

pub mod collectors;

use crate::config::CollectionConfig;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, Report};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

// ============================================
// Collector trait
// ============================================

/// A source of report fields.
///
/// Collectors run on blocking worker threads and must be `Send + Sync`.
/// A collector that would be unsafe to run for a given failure (for example
/// one that allocates heavily after an out-of-memory condition) opts out
/// through [`FieldCollector::enabled`]; the orchestrator never special-cases
/// failure kinds.
///
/// ## Example
///
/// ```rust,ignore
/// use crashpost_core::collect::FieldCollector;
///
/// struct BuildInfo;
///
/// impl FieldCollector for BuildInfo {
///     fn name(&self) -> &str { "build_info" }
///
///     fn collect(&self, _ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
///         Ok(vec![("BUILD".to_string(), json!(env!("CARGO_PKG_VERSION")))])
///     }
/// }
/// ```
pub trait FieldCollector: Send + Sync {
    /// Unique name, used in logs and in `collection.disabled_collectors`.
    fn name(&self) -> &str;

    /// Tier this collector runs in.
    fn order(&self) -> CollectorOrder {
        CollectorOrder::Normal
    }

    /// Pre-check; returning false skips the collector for this failure.
    fn enabled(&self, _ctx: &CrashContext) -> bool {
        true
    }

    /// Produce fields for the report.
    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>>;
}

// ============================================
// Run results
// ============================================

/// Status of a collector run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorRunStatus {
    /// Collector produced its fields
    Success,
    /// Collector returned an error
    Error,
    /// Collector panicked
    Panicked,
    /// Collector exceeded the configured timeout
    Timeout,
    /// Collector was disabled by configuration or its own pre-check
    Skipped,
}

impl CollectorRunStatus {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorRunStatus::Success => "success",
            CollectorRunStatus::Error => "error",
            CollectorRunStatus::Panicked => "panicked",
            CollectorRunStatus::Timeout => "timeout",
            CollectorRunStatus::Skipped => "skipped",
        }
    }
}

/// Outcome of one collector during one collection.
///
/// Never escapes the orchestrator except as observability data.
#[derive(Debug, Clone)]
pub struct CollectorRunResult {
    /// Name of the collector
    pub collector_name: String,
    /// Tier it ran in
    pub order: CollectorOrder,
    /// How it ended
    pub status: CollectorRunStatus,
    /// Wall time including queueing for a worker
    pub duration_ms: u64,
    /// Number of fields merged into the report
    pub fields_produced: usize,
    /// Error description for failed runs
    pub error_message: Option<String>,
}

struct CollectorOutcome {
    result: CollectorRunResult,
    fields: Vec<(String, Value)>,
}

impl CollectorOutcome {
    fn failed(
        collector: &dyn FieldCollector,
        status: CollectorRunStatus,
        started: Instant,
        message: Option<String>,
    ) -> Self {
        Self {
            result: CollectorRunResult {
                collector_name: collector.name().to_string(),
                order: collector.order(),
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                fields_produced: 0,
                error_message: message,
            },
            fields: Vec::new(),
        }
    }
}

// ============================================
// Orchestrator
// ============================================

/// Runs registered collectors and assembles the report.
pub struct CollectionOrchestrator {
    collectors: Vec<Arc<dyn FieldCollector>>,
    parallel: bool,
    max_workers: usize,
    timeout: Duration,
    config: CollectionConfig,
}

impl CollectionOrchestrator {
    /// Create an orchestrator with no collectors.
    pub fn new(config: &CollectionConfig) -> Self {
        Self {
            collectors: Vec::new(),
            parallel: config.parallel,
            max_workers: config.max_workers.max(1),
            timeout: config.collector_timeout(),
            config: config.clone(),
        }
    }

    /// Register a collector.
    pub fn register(&mut self, collector: Arc<dyn FieldCollector>) {
        tracing::debug!(
            collector = collector.name(),
            order = %collector.order(),
            "Registered field collector"
        );
        self.collectors.push(collector);
    }

    /// Get list of registered collector names.
    pub fn collector_names(&self) -> Vec<&str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Check if a collector is registered.
    pub fn has_collector(&self, name: &str) -> bool {
        self.collectors.iter().any(|c| c.name() == name)
    }

    /// Collect a report for a failure.
    pub async fn collect(&self, ctx: Arc<CrashContext>) -> Report {
        self.collect_with_results(ctx).await.0
    }

    /// Collect a report and return per-collector run results alongside it.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn collect_with_results(
        &self,
        ctx: Arc<CrashContext>,
    ) -> (Report, Vec<CollectorRunResult>) {
        let mut report = Report::new(Utc::now(), ctx.is_silent);
        let mut results = Vec::with_capacity(self.collectors.len());
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        for order in CollectorOrder::ALL {
            let tier: Vec<Arc<dyn FieldCollector>> = self
                .collectors
                .iter()
                .filter(|c| c.order() == order)
                .cloned()
                .collect();
            if tier.is_empty() {
                continue;
            }

            tracing::debug!(tier = %order, collectors = tier.len(), "Running collector tier");

            let outcomes = if self.parallel {
                self.run_tier_concurrently(&tier, &ctx, &semaphore).await
            } else {
                let mut outcomes = Vec::with_capacity(tier.len());
                for collector in &tier {
                    outcomes.push(self.run_one(Arc::clone(collector), &ctx, &semaphore).await);
                }
                outcomes
            };

            // Outcomes are in registration order regardless of completion order.
            for outcome in outcomes {
                report.merge(outcome.fields);
                results.push(outcome.result);
            }
        }

        tracing::debug!(
            fields = report.len(),
            collectors = results.len(),
            "Collection finished"
        );

        (report, results)
    }

    async fn run_tier_concurrently(
        &self,
        tier: &[Arc<dyn FieldCollector>],
        ctx: &Arc<CrashContext>,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<CollectorOutcome> {
        let handles: Vec<_> = tier
            .iter()
            .map(|collector| {
                let collector = Arc::clone(collector);
                let ctx = Arc::clone(ctx);
                let semaphore = Arc::clone(semaphore);
                let timeout = self.timeout;
                let disabled = self.config.is_disabled(collector.name());
                tokio::spawn(async move {
                    run_collector(collector, ctx, semaphore, timeout, disabled).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (handle, collector) in handles.into_iter().zip(tier) {
            let started = Instant::now();
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::error!(
                        collector = collector.name(),
                        error = %e,
                        "Collector task aborted"
                    );
                    outcomes.push(CollectorOutcome::failed(
                        collector.as_ref(),
                        CollectorRunStatus::Panicked,
                        started,
                        Some(e.to_string()),
                    ));
                }
            }
        }
        outcomes
    }

    async fn run_one(
        &self,
        collector: Arc<dyn FieldCollector>,
        ctx: &Arc<CrashContext>,
        semaphore: &Arc<Semaphore>,
    ) -> CollectorOutcome {
        let disabled = self.config.is_disabled(collector.name());
        run_collector(
            collector,
            Arc::clone(ctx),
            Arc::clone(semaphore),
            self.timeout,
            disabled,
        )
        .await
    }
}

/// Run a single collector with full fault isolation.
///
/// The worker permit is released on timeout; the abandoned blocking call
/// finishes on its own and its output is discarded.
async fn run_collector(
    collector: Arc<dyn FieldCollector>,
    ctx: Arc<CrashContext>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    disabled: bool,
) -> CollectorOutcome {
    let started = Instant::now();

    if disabled || !collector.enabled(&ctx) {
        tracing::debug!(collector = collector.name(), "Collector skipped");
        return CollectorOutcome::failed(
            collector.as_ref(),
            CollectorRunStatus::Skipped,
            started,
            None,
        );
    }

    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => {
            return CollectorOutcome::failed(
                collector.as_ref(),
                CollectorRunStatus::Error,
                started,
                Some(e.to_string()),
            )
        }
    };

    let worker = {
        let collector = Arc::clone(&collector);
        let ctx = Arc::clone(&ctx);
        tokio::task::spawn_blocking(move || collector.collect(&ctx))
    };

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(Ok(fields))) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            tracing::debug!(
                collector = collector.name(),
                fields = fields.len(),
                duration_ms,
                "Collector completed"
            );
            CollectorOutcome {
                result: CollectorRunResult {
                    collector_name: collector.name().to_string(),
                    order: collector.order(),
                    status: CollectorRunStatus::Success,
                    duration_ms,
                    fields_produced: fields.len(),
                    error_message: None,
                },
                fields,
            }
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(collector = collector.name(), error = %e, "Collector failed");
            CollectorOutcome::failed(
                collector.as_ref(),
                CollectorRunStatus::Error,
                started,
                Some(e.to_string()),
            )
        }
        Ok(Err(e)) => {
            tracing::error!(collector = collector.name(), error = %e, "Collector panicked");
            CollectorOutcome::failed(
                collector.as_ref(),
                CollectorRunStatus::Panicked,
                started,
                Some(e.to_string()),
            )
        }
        Err(_) => {
            tracing::warn!(
                collector = collector.name(),
                timeout_ms = timeout.as_millis() as u64,
                "Collector exceeded timeout; dropping its fields"
            );
            CollectorOutcome::failed(
                collector.as_ref(),
                CollectorRunStatus::Timeout,
                started,
                Some(format!(
                    "collector {} exceeded timeout of {}ms",
                    collector.name(),
                    timeout.as_millis()
                )),
            )
        }
    }
}
