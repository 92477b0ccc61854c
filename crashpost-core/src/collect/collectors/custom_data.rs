//! Host-supplied custom key/values

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, ReportField};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Custom data shared between the host (writer) and the collector (reader).
pub type SharedCustomData = Arc<RwLock<BTreeMap<String, String>>>;

/// Emits CUSTOM_DATA: global custom data overlaid with the context's own.
pub struct CustomDataCollector {
    global: SharedCustomData,
}

impl CustomDataCollector {
    pub fn new(global: SharedCustomData) -> Self {
        Self { global }
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        // A writer that panicked mid-update still left a usable map.
        match self.global.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl FieldCollector for CustomDataCollector {
    fn name(&self) -> &str {
        "custom_data"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::Late
    }

    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        let mut merged = self.snapshot();
        merged.extend(ctx.custom_data.clone());

        if merged.is_empty() {
            return Ok(vec![]);
        }

        let object: Map<String, Value> = merged
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        Ok(vec![(ReportField::CustomData.into(), Value::Object(object))])
    }
}
