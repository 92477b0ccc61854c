//! Allow-listed environment variables

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CrashContext, ReportField};
use serde_json::{Map, Value};

/// Emits ENVIRONMENT as an object of the allow-listed variables that are set.
pub struct EnvironmentCollector {
    vars: Vec<String>,
}

impl EnvironmentCollector {
    pub fn new(vars: Vec<String>) -> Self {
        Self { vars }
    }
}

impl FieldCollector for EnvironmentCollector {
    fn name(&self) -> &str {
        "environment"
    }

    fn enabled(&self, _ctx: &CrashContext) -> bool {
        !self.vars.is_empty()
    }

    fn collect(&self, _ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        let mut env = Map::new();
        for name in &self.vars {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), Value::String(value));
            }
        }
        Ok(vec![(ReportField::Environment.into(), Value::Object(env))])
    }
}
