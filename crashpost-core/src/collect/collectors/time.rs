//! Timestamps: application start and failure occurrence

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, ReportField};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

/// Emits USER_APP_START_DATE and USER_CRASH_DATE (RFC 3339, UTC).
pub struct TimeCollector {
    app_started_at: DateTime<Utc>,
}

impl TimeCollector {
    pub fn new(app_started_at: DateTime<Utc>) -> Self {
        Self { app_started_at }
    }
}

impl FieldCollector for TimeCollector {
    fn name(&self) -> &str {
        "time"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::Early
    }

    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        Ok(vec![
            (
                ReportField::UserAppStartDate.into(),
                json!(self.app_started_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            (
                ReportField::UserCrashDate.into(),
                json!(ctx.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
        ])
    }
}
