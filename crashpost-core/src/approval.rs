//! Approval of pending reports
//!
//! A freshly written report sits in the pending queue until it is approved
//! for sending. Silent reports, and hosts without approval collaborators,
//! approve immediately. Otherwise every [`ApprovalCollaborator`] is asked
//! concurrently and the gate waits a bounded time for their answers:
//!
//! - all collaborators answer `true`: the report moves to the approved queue;
//! - any collaborator answers `false` or the wait times out: the report stays
//!   pending. A UI that took ownership resumes later through
//!   [`ApprovalGate::approve`] or [`ApprovalGate::discard`].

use crate::config::SendingConfig;
use crate::error::{Error, Result};
use crate::store::{QueueState, ReportFile, ReportStore};
use crate::types::{Report, ReportField};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Something that decides whether a report may be sent now.
#[async_trait]
pub trait ApprovalCollaborator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Return true to send now, false to defer.
    async fn request_approval(&self, file: &ReportFile, report: &Report) -> bool;
}

/// Result of running the gate on a pending report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Report was promoted to the approved queue
    Approved(ReportFile),
    /// Report stays pending
    Deferred(ReportFile),
}

impl ApprovalOutcome {
    /// True when the report was approved
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved(_))
    }

    /// Handle to the report after the gate ran
    pub fn file(&self) -> &ReportFile {
        match self {
            ApprovalOutcome::Approved(file) | ApprovalOutcome::Deferred(file) => file,
        }
    }
}

/// Optional user feedback attached when approving.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserComment {
    pub comment: Option<String>,
    pub email: Option<String>,
}

/// Moves reports from pending to approved.
pub struct ApprovalGate {
    store: ReportStore,
    collaborators: Vec<Arc<dyn ApprovalCollaborator>>,
    timeout: Duration,
}

impl ApprovalGate {
    /// Create a gate with no collaborators (everything auto-approves).
    pub fn new(store: ReportStore, config: &SendingConfig) -> Self {
        Self {
            store,
            collaborators: Vec::new(),
            timeout: config.approval_timeout(),
        }
    }

    /// Register a collaborator.
    pub fn register(&mut self, collaborator: Arc<dyn ApprovalCollaborator>) {
        tracing::debug!(collaborator = collaborator.name(), "Registered approval collaborator");
        self.collaborators.push(collaborator);
    }

    /// Get list of registered collaborator names.
    pub fn collaborator_names(&self) -> Vec<&str> {
        self.collaborators.iter().map(|c| c.name()).collect()
    }

    /// Run the gate on a pending report.
    pub async fn run(&self, file: &ReportFile, report: &Report) -> Result<ApprovalOutcome> {
        if file.state != QueueState::Pending {
            return Err(Error::Store(format!(
                "report is not pending: {}",
                file.file_name()
            )));
        }

        if file.is_silent || self.collaborators.is_empty() {
            return Ok(ApprovalOutcome::Approved(self.store.promote(file)?));
        }

        if self.ask_collaborators(file, report).await {
            Ok(ApprovalOutcome::Approved(self.store.promote(file)?))
        } else {
            tracing::info!(file = file.file_name(), "Report approval deferred");
            Ok(ApprovalOutcome::Deferred(file.clone()))
        }
    }

    /// Approve a pending report, optionally attaching user feedback first.
    pub fn approve(&self, file: &ReportFile, comment: Option<UserComment>) -> Result<ReportFile> {
        if let Some(comment) = comment {
            let mut report = self.store.load(file)?;
            if let Some(text) = comment.comment {
                report.put(ReportField::UserComment, text);
            }
            if let Some(email) = comment.email {
                report.put(ReportField::UserEmail, email);
            }
            self.store.update_pending(file, &report)?;
        }

        let approved = self.store.promote(file)?;
        tracing::info!(file = approved.file_name(), "Report approved");
        Ok(approved)
    }

    /// Drop a pending report the user declined to send.
    pub fn discard(&self, file: &ReportFile) -> Result<()> {
        if file.state != QueueState::Pending {
            return Err(Error::Store(format!(
                "only pending reports can be discarded: {}",
                file.file_name()
            )));
        }
        self.store.delete(file)?;
        tracing::info!(file = file.file_name(), "Report discarded");
        Ok(())
    }

    async fn ask_collaborators(&self, file: &ReportFile, report: &Report) -> bool {
        let mut tasks = JoinSet::new();
        for collaborator in &self.collaborators {
            let collaborator = Arc::clone(collaborator);
            let file = file.clone();
            let report = report.clone();
            tasks.spawn(async move {
                let approved = collaborator.request_approval(&file, &report).await;
                (collaborator.name().to_string(), approved)
            });
        }

        // Every collaborator gets to answer, even after a refusal.
        let all_approved = async {
            let mut approved = true;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, true)) => {}
                    Ok((name, false)) => {
                        tracing::debug!(collaborator = %name, "Collaborator deferred approval");
                        approved = false;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Approval collaborator failed");
                        approved = false;
                    }
                }
            }
            approved
        };

        match tokio::time::timeout(self.timeout, all_approved).await {
            Ok(approved) => approved,
            Err(_) => {
                tracing::warn!(
                    file = file.file_name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Approval timed out"
                );
                false
            }
        }
    }
}
