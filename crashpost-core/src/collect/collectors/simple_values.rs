//! Process and application identity collectors

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, ReportField};
use serde_json::{json, Value};
use uuid::Uuid;

/// Emits REPORT_ID, APP_NAME, APP_VERSION, OS, ARCH, PROCESS_ID and IS_SILENT.
pub struct SimpleValuesCollector {
    app_name: String,
    app_version: String,
}

impl SimpleValuesCollector {
    pub fn new(app_name: &str, app_version: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            app_version: app_version.to_string(),
        }
    }
}

impl FieldCollector for SimpleValuesCollector {
    fn name(&self) -> &str {
        "simple_values"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::First
    }

    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        Ok(vec![
            (ReportField::ReportId.into(), json!(Uuid::new_v4().to_string())),
            (ReportField::AppName.into(), json!(self.app_name)),
            (ReportField::AppVersion.into(), json!(self.app_version)),
            (ReportField::Os.into(), json!(std::env::consts::OS)),
            (ReportField::Arch.into(), json!(std::env::consts::ARCH)),
            (ReportField::ProcessId.into(), json!(std::process::id())),
            (ReportField::IsSilent.into(), json!(ctx.is_silent)),
        ])
    }
}

/// Emits THREAD_NAME for the thread that failed.
pub struct ThreadCollector;

impl FieldCollector for ThreadCollector {
    fn name(&self) -> &str {
        "thread"
    }

    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        let name = ctx.thread_name.as_deref().unwrap_or("<unnamed>");
        Ok(vec![(ReportField::ThreadName.into(), json!(name))])
    }
}
