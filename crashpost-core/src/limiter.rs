//! Sliding-window rate limiting of reports
//!
//! The limiter keeps a ledger of fingerprints of every report it let
//! through, persisted as `<report root>/limiter.json`. Two gates use it:
//!
//! - **before collection** ([`RateLimiter::may_collect`]): stops when the
//!   queue already holds `failed_report_limit` reports (nothing is being
//!   sent) or the window holds `overall_limit` entries;
//! - **after collection** ([`RateLimiter::record_if_allowed`]): stops when
//!   the same stack trace or the same exception class already reached its
//!   limit inside the window, and otherwise appends the report's entry.
//!
//! ## Window boundary
//!
//! An entry counts only while `timestamp > now - retention`. An entry
//! whose timestamp is exactly `now - retention` has already expired.
//!
//! Both pre-collection checks are best effort: concurrent failures may each
//! pass the same check before either is recorded.

use crate::collect::collectors::stack_trace_hash;
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::store::{write_atomically, ReportStore};
use crate::types::{CrashContext, Report, ReportField};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// File name of the persisted ledger inside the report root
pub const LEDGER_FILE: &str = "limiter.json";

// ============================================
// Ledger
// ============================================

/// Fingerprint of one report that was allowed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Hash of the normalized stack trace
    pub stacktrace_hash: String,
    /// Exception class of the failure
    pub exception_class: String,
    /// When the report was recorded
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// Fingerprint a collected report.
    ///
    /// Prefers the collected STACK_TRACE_HASH, falls back to hashing
    /// STACK_TRACE, and uses an empty fingerprint when neither exists.
    pub fn for_report(report: &Report, timestamp: DateTime<Utc>) -> Self {
        let stacktrace_hash = report
            .get_str(ReportField::StackTraceHash)
            .map(str::to_string)
            .or_else(|| report.get_str(ReportField::StackTrace).map(stack_trace_hash))
            .unwrap_or_default();
        let exception_class = report
            .get_str(ReportField::ExceptionClass)
            .unwrap_or_default()
            .to_string();

        Self {
            stacktrace_hash,
            exception_class,
            timestamp,
        }
    }
}

/// Persisted rate-limiting history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterLedger {
    /// Application version the entries were recorded under
    #[serde(default)]
    pub app_version: Option<String>,
    /// Entries in recording order
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
}

impl LimiterLedger {
    /// Drop entries outside the window ending at `now`.
    pub fn purge(&mut self, now: DateTime<Utc>, retention: chrono::Duration) {
        let cutoff = now - retention;
        self.entries.retain(|e| e.timestamp > cutoff);
    }

    fn count_stacktrace(&self, hash: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.stacktrace_hash == hash)
            .count()
    }

    fn count_exception_class(&self, class: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.exception_class == class)
            .count()
    }
}

// ============================================
// Decisions
// ============================================

/// Which limit rejected a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Too many reports already queued on disk
    FailedReportLimit { queued: usize, limit: usize },
    /// Too many reports in the window
    OverallLimit { count: usize, limit: usize },
    /// Too many reports with this stack trace in the window
    StacktraceLimit { count: usize, limit: usize },
    /// Too many reports with this exception class in the window
    ExceptionClassLimit {
        exception_class: String,
        count: usize,
        limit: usize,
    },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::FailedReportLimit { queued, limit } => {
                write!(f, "{} reports already queued (limit {})", queued, limit)
            }
            DropReason::OverallLimit { count, limit } => {
                write!(f, "{} reports in window (limit {})", count, limit)
            }
            DropReason::StacktraceLimit { count, limit } => {
                write!(f, "{} reports with this stack trace (limit {})", count, limit)
            }
            DropReason::ExceptionClassLimit {
                exception_class,
                count,
                limit,
            } => write!(
                f,
                "{} reports of {} (limit {})",
                count, exception_class, limit
            ),
        }
    }
}

/// Outcome of a limiter gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Allow,
    Drop(DropReason),
}

impl LimitDecision {
    /// True when the report may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allow)
    }
}

/// Hook for user-visible feedback when a report is dropped.
pub trait DropNotifier: Send + Sync {
    fn report_dropped(&self, ctx: &CrashContext, reason: &DropReason);
}

/// Default notifier: logs and nothing else.
pub struct LogDropNotifier;

impl DropNotifier for LogDropNotifier {
    fn report_dropped(&self, ctx: &CrashContext, reason: &DropReason) {
        tracing::info!(
            exception_class = ctx.exception_class.as_deref().unwrap_or("<none>"),
            reason = %reason,
            "Report dropped by rate limiter"
        );
    }
}

// ============================================
// Limiter
// ============================================

/// Rate limiter backed by the ledger file and the report queue counts.
pub struct RateLimiter {
    config: LimiterConfig,
    store: ReportStore,
    ledger_path: PathBuf,
    lock: Mutex<()>,
}

impl RateLimiter {
    /// Create a limiter whose ledger lives next to the store's queues.
    pub fn new(config: LimiterConfig, store: ReportStore) -> Self {
        let ledger_path = store.root().join(LEDGER_FILE);
        Self {
            config,
            store,
            ledger_path,
            lock: Mutex::new(()),
        }
    }

    /// Path of the persisted ledger
    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    /// Pre-collection gate. Pure read: calling it repeatedly without
    /// recording anything returns the same answer.
    pub fn may_collect(&self, ctx: &CrashContext) -> bool {
        self.check_collect_at(ctx, Utc::now()).is_allowed()
    }

    /// Pre-collection gate at an explicit time.
    pub fn check_collect_at(&self, _ctx: &CrashContext, now: DateTime<Utc>) -> LimitDecision {
        if !self.config.enabled {
            return LimitDecision::Allow;
        }

        match self.store.counts() {
            Ok(counts) if counts.total() >= self.config.failed_report_limit => {
                return LimitDecision::Drop(DropReason::FailedReportLimit {
                    queued: counts.total(),
                    limit: self.config.failed_report_limit,
                });
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not count queued reports"),
        }

        let ledger = self.load_purged(now);
        if ledger.entries.len() >= self.config.overall_limit {
            return LimitDecision::Drop(DropReason::OverallLimit {
                count: ledger.entries.len(),
                limit: self.config.overall_limit,
            });
        }

        LimitDecision::Allow
    }

    /// Post-collection gate. Pure read.
    pub fn may_queue_for_send(&self, report: &Report) -> bool {
        self.check_queue_at(report, Utc::now()).is_allowed()
    }

    /// Post-collection gate at an explicit time.
    pub fn check_queue_at(&self, report: &Report, now: DateTime<Utc>) -> LimitDecision {
        if !self.config.enabled {
            return LimitDecision::Allow;
        }
        let ledger = self.load_purged(now);
        self.check_fingerprint(&ledger, &LedgerEntry::for_report(report, now))
    }

    /// Check the post-collection limits and, if they pass, append the
    /// report's entry and persist the ledger before returning.
    pub fn record_if_allowed(&self, report: &Report) -> Result<LimitDecision> {
        self.record_if_allowed_at(report, Utc::now())
    }

    /// [`RateLimiter::record_if_allowed`] at an explicit time.
    pub fn record_if_allowed_at(&self, report: &Report, now: DateTime<Utc>) -> Result<LimitDecision> {
        if !self.config.enabled {
            return Ok(LimitDecision::Allow);
        }

        let _guard = self.guard();
        let mut ledger = self.load_purged(now);
        let entry = LedgerEntry::for_report(report, now);

        let decision = self.check_fingerprint(&ledger, &entry);
        if decision.is_allowed() {
            ledger.entries.push(entry);
            self.save(&ledger)?;
            tracing::debug!(entries = ledger.entries.len(), "Recorded report in limiter ledger");
        }
        Ok(decision)
    }

    /// Entries inside the current window.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.load_purged(Utc::now()).entries
    }

    /// Clear every entry.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.guard();
        let mut ledger = self.load();
        ledger.entries.clear();
        self.save(&ledger)
    }

    /// Clear the ledger when `app_version` differs from the version it was
    /// recorded under. Returns whether entries were cleared.
    pub fn reset_if_version_changed(&self, app_version: &str) -> Result<bool> {
        let _guard = self.guard();
        let mut ledger = self.load();

        if ledger.app_version.as_deref() == Some(app_version) {
            return Ok(false);
        }

        tracing::info!(
            previous = ledger.app_version.as_deref().unwrap_or("<none>"),
            current = app_version,
            entries = ledger.entries.len(),
            "Application version changed; resetting limiter ledger"
        );
        let cleared = !ledger.entries.is_empty();
        ledger.entries.clear();
        ledger.app_version = Some(app_version.to_string());
        self.save(&ledger)?;
        Ok(cleared)
    }

    fn check_fingerprint(&self, ledger: &LimiterLedger, entry: &LedgerEntry) -> LimitDecision {
        let same_trace = ledger.count_stacktrace(&entry.stacktrace_hash);
        if same_trace >= self.config.stacktrace_limit {
            return LimitDecision::Drop(DropReason::StacktraceLimit {
                count: same_trace,
                limit: self.config.stacktrace_limit,
            });
        }

        let same_class = ledger.count_exception_class(&entry.exception_class);
        if same_class >= self.config.exception_class_limit {
            return LimitDecision::Drop(DropReason::ExceptionClassLimit {
                exception_class: entry.exception_class.clone(),
                count: same_class,
                limit: self.config.exception_class_limit,
            });
        }

        LimitDecision::Allow
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_purged(&self, now: DateTime<Utc>) -> LimiterLedger {
        let mut ledger = self.load();
        ledger.purge(now, self.config.retention());
        ledger
    }

    /// Missing or unreadable ledgers count as empty.
    fn load(&self) -> LimiterLedger {
        let content = match std::fs::read_to_string(&self.ledger_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LimiterLedger::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read limiter ledger; starting empty");
                return LimiterLedger::default();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Corrupt limiter ledger; starting empty");
            LimiterLedger::default()
        })
    }

    fn save(&self, ledger: &LimiterLedger) -> Result<()> {
        let content = serde_json::to_vec_pretty(ledger)?;
        write_atomically(&self.ledger_path, &content)
    }
}
