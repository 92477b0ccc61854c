//! Entry point for "send soon" requests
//!
//! The pipeline never sends inline. It asks a [`Scheduler`] to run the
//! dispatch coordinator, so hosts can swap immediate background execution
//! for an OS-level deferred job.

use super::DispatchCoordinator;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Host hook that arranges for approved reports to be sent.
pub trait Scheduler: Send + Sync {
    fn schedule_send(&self, only_silent: bool);
}

/// Runs `send_all` as a task on a tokio runtime.
pub struct RuntimeScheduler {
    handle: Handle,
    coordinator: Arc<DispatchCoordinator>,
}

impl RuntimeScheduler {
    pub fn new(handle: Handle, coordinator: Arc<DispatchCoordinator>) -> Self {
        Self {
            handle,
            coordinator,
        }
    }
}

impl Scheduler for RuntimeScheduler {
    fn schedule_send(&self, only_silent: bool) {
        let coordinator = Arc::clone(&self.coordinator);
        self.handle.spawn(async move {
            if let Err(e) = coordinator.send_all(false, only_silent).await {
                tracing::error!(error = %e, "Scheduled send failed");
            }
        });
    }
}
