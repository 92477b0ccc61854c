//! Panic hook integration
//!
//! [`install_panic_hook`] reports every panic through an [`ErrorReporter`]
//! and then hands the panic to whatever hook was installed before, so the
//! host keeps its normal panic output and abort behavior.

use crate::reporter::{ErrorReporter, RUNTIME_THREAD_NAME};
use crate::types::CrashContext;
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Install a panic hook that reports panics, waiting at most
/// `reporter.handle_timeout_ms` for the pipeline.
///
/// Panics raised on the reporter's own threads (a buggy collector or
/// sender) are not reported again; they only reach the previous hook.
pub fn install_panic_hook(reporter: Arc<ErrorReporter>) {
    let timeout = Duration::from_millis(reporter.config().reporter.handle_timeout_ms);
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        if should_report() {
            IN_HOOK.with(|flag| flag.set(true));
            let ctx = CrashContext::from_panic(info);
            match reporter.handle_blocking(ctx, timeout) {
                Ok(outcome) => tracing::info!(outcome = ?outcome, "Reported panic"),
                Err(e) => tracing::error!(error = %e, "Failed to report panic"),
            }
            IN_HOOK.with(|flag| flag.set(false));
        }
        previous(info);
    }));

    tracing::debug!("Installed crash reporting panic hook");
}

fn should_report() -> bool {
    if IN_HOOK.with(Cell::get) {
        return false;
    }
    std::thread::current().name() != Some(RUNTIME_THREAD_NAME)
}
