//! Built-in field collectors
//!
//! Each collector lives in its own file. The registry is explicit: hosts
//! get the built-ins from [`create_default_collectors`] and add their own
//! through [`CollectionOrchestrator::register`](super::CollectionOrchestrator::register).
//!
//! ## Built-in Collectors
//!
//! | Name | Tier | Fields |
//! |------|------|--------|
//! | `stacktrace` | FIRST | MESSAGE, EXCEPTION_CLASS, STACK_TRACE, STACK_TRACE_HASH |
//! | `simple_values` | FIRST | REPORT_ID, APP_NAME, APP_VERSION, OS, ARCH, PROCESS_ID, IS_SILENT |
//! | `time` | EARLY | USER_APP_START_DATE, USER_CRASH_DATE |
//! | `thread` | NORMAL | THREAD_NAME |
//! | `environment` | NORMAL | ENVIRONMENT |
//! | `custom_data` | LATE | CUSTOM_DATA |
//! | `log_file` | LAST | APPLICATION_LOG |

pub mod custom_data;
pub mod environment;
pub mod log_file;
pub mod simple_values;
pub mod stacktrace;
pub mod time;

pub use custom_data::{CustomDataCollector, SharedCustomData};
pub use environment::EnvironmentCollector;
pub use log_file::LogFileCollector;
pub use simple_values::{SimpleValuesCollector, ThreadCollector};
pub use stacktrace::{normalize_stack_trace, stack_trace_hash, StacktraceCollector};
pub use time::TimeCollector;

use super::{CollectionOrchestrator, FieldCollector};
use crate::config::Config;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// All built-in collectors configured from `config`.
pub fn create_default_collectors(
    config: &Config,
    custom_data: SharedCustomData,
    app_started_at: DateTime<Utc>,
) -> Vec<Arc<dyn FieldCollector>> {
    let mut collectors: Vec<Arc<dyn FieldCollector>> = vec![
        Arc::new(StacktraceCollector),
        Arc::new(SimpleValuesCollector::new(
            &config.reporter.app_name,
            &config.reporter.app_version,
        )),
        Arc::new(TimeCollector::new(app_started_at)),
        Arc::new(ThreadCollector),
        Arc::new(EnvironmentCollector::new(
            config.collection.environment_vars.clone(),
        )),
        Arc::new(CustomDataCollector::new(custom_data)),
    ];

    if let Some(path) = &config.collection.log_file {
        collectors.push(Arc::new(LogFileCollector::new(
            path.clone(),
            config.collection.log_lines,
        )));
    }

    collectors
}

/// Create an orchestrator with all built-in collectors registered.
pub fn create_default_orchestrator(
    config: &Config,
    custom_data: SharedCustomData,
    app_started_at: DateTime<Utc>,
) -> CollectionOrchestrator {
    let mut orchestrator = CollectionOrchestrator::new(&config.collection);
    for collector in create_default_collectors(config, custom_data, app_started_at) {
        orchestrator.register(collector);
    }
    orchestrator
}
