//! # crashpost-core
//!
//! Core library for crashpost - a durable crash and error report pipeline.
//!
//! This library provides:
//! - Tiered, fault-isolated collection of report fields
//! - A file-backed pending/approved report queue
//! - Sliding-window rate limiting with a persisted ledger
//! - Approval, batched delivery with pluggable retry policies
//! - Startup reconciliation of reports left by a previous run
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! A failure flows through four stages:
//! - **Collect:** collectors turn a [`CrashContext`] into a [`Report`]
//! - **Limit:** the [`RateLimiter`] decides whether the report is kept
//! - **Queue:** the [`ReportStore`] persists it as pending, then approved
//! - **Send:** the [`DispatchCoordinator`] delivers approved reports
//!
//! Everything on disk is resumable: a process that dies at any point leaves
//! files the next run's [`StartupReconciler`] knows how to handle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use crashpost_core::{Config, CrashContext, ErrorReporter};
//! use std::sync::Arc;
//!
//! // Load configuration and build the pipeline
//! let config = Config::load().expect("failed to load config");
//! let reporter = Arc::new(ErrorReporter::new(config).expect("failed to build reporter"));
//!
//! // Clean up reports from the previous run, then report panics
//! reporter.start();
//! crashpost_core::panic::install_panic_hook(Arc::clone(&reporter));
//! ```

// Re-export commonly used items at the crate root
pub use approval::{ApprovalCollaborator, ApprovalGate, ApprovalOutcome, UserComment};
pub use collect::{CollectionOrchestrator, FieldCollector};
pub use config::Config;
pub use error::{Error, Result};
pub use limiter::{DropNotifier, DropReason, LimitDecision, RateLimiter};
pub use reporter::{ErrorReporter, ErrorReporterBuilder, ReportOutcome};
pub use send::{DispatchCoordinator, FailedSender, ReportSender, RetryPolicy, Scheduler, SendSummary};
pub use startup::{ReconcileSummary, StartupProcessor, StartupReconciler};
pub use store::{QueueState, ReportFile, ReportStore};
pub use types::*;

// Public modules
pub mod approval;
pub mod collect;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod panic;
pub mod reporter;
pub mod send;
pub mod startup;
pub mod store;
pub mod types;
