//! Keep-or-drop decisions after a partially failed send
//!
//! A retry policy sees every sender that was asked to deliver a report and
//! the subset that failed. Returning `true` keeps the report in the
//! approved queue for the next send; `false` deletes it.

use super::{FailedSender, ReportSender};
use crate::config::{RetryPolicyKind, SendingConfig};
use std::sync::Arc;

/// Decides whether a report whose delivery partly failed is kept.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool;
}

impl<F> RetryPolicy for F
where
    F: Fn(&[Arc<dyn ReportSender>], &[FailedSender]) -> bool + Send + Sync,
{
    fn should_retry(&self, senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool {
        self(senders, failed)
    }
}

/// Keep the report only when no sender delivered it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryWhenAllFailed;

impl RetryPolicy for RetryWhenAllFailed {
    fn should_retry(&self, senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool {
        !senders.is_empty() && failed.len() >= senders.len()
    }
}

/// Keep the report after a partial failure; give up once every sender failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryUnlessAllFailed;

impl RetryPolicy for RetryUnlessAllFailed {
    fn should_retry(&self, senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool {
        !failed.is_empty() && failed.len() < senders.len()
    }
}

/// Keep the report whenever any sender failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnAnyFailure;

impl RetryPolicy for RetryOnAnyFailure {
    fn should_retry(&self, _senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool {
        !failed.is_empty()
    }
}

/// Keep the report while the share of failed senders exceeds a ratio.
#[derive(Debug, Clone, Copy)]
pub struct FailureRatio {
    pub max_failure_ratio: f64,
}

impl RetryPolicy for FailureRatio {
    fn should_retry(&self, senders: &[Arc<dyn ReportSender>], failed: &[FailedSender]) -> bool {
        if senders.is_empty() {
            return false;
        }
        let ratio = failed.len() as f64 / senders.len() as f64;
        ratio > self.max_failure_ratio
    }
}

/// Build the policy selected in configuration.
pub fn from_config(config: &SendingConfig) -> Arc<dyn RetryPolicy> {
    match config.retry_policy {
        RetryPolicyKind::RetryWhenAllFailed => Arc::new(RetryWhenAllFailed),
        RetryPolicyKind::RetryUnlessAllFailed => Arc::new(RetryUnlessAllFailed),
        RetryPolicyKind::RetryOnAnyFailure => Arc::new(RetryOnAnyFailure),
        RetryPolicyKind::FailureRatio => Arc::new(FailureRatio {
            max_failure_ratio: config.max_failure_ratio,
        }),
    }
}
