//! Core domain types for crashpost
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Report** | The structured snapshot of diagnostic fields produced for one failure |
//! | **CrashContext** | What the host knows about a failure at the moment it happens |
//! | **Collector** | A source of fields; runs in one of five ordered tiers |
//! | **Pending / Approved** | The two queue states a persisted report passes through |
//! | **Ledger** | Persisted rate-limiting history of past report fingerprints |
//! | **Sender** | A delivery channel for approved reports |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use crate::error::Result;

// ============================================
// Report fields
// ============================================

/// Well-known report field names.
///
/// Collectors are free to emit other keys; these are the ones the pipeline
/// itself reads (limiter fingerprints, silent flag, user comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportField {
    ReportId,
    AppName,
    AppVersion,
    Os,
    Arch,
    ProcessId,
    ThreadName,
    Message,
    ExceptionClass,
    StackTrace,
    StackTraceHash,
    UserAppStartDate,
    UserCrashDate,
    IsSilent,
    CustomData,
    Environment,
    ApplicationLog,
    UserComment,
    UserEmail,
}

impl ReportField {
    /// Returns the key under which this field is stored
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportField::ReportId => "REPORT_ID",
            ReportField::AppName => "APP_NAME",
            ReportField::AppVersion => "APP_VERSION",
            ReportField::Os => "OS",
            ReportField::Arch => "ARCH",
            ReportField::ProcessId => "PROCESS_ID",
            ReportField::ThreadName => "THREAD_NAME",
            ReportField::Message => "MESSAGE",
            ReportField::ExceptionClass => "EXCEPTION_CLASS",
            ReportField::StackTrace => "STACK_TRACE",
            ReportField::StackTraceHash => "STACK_TRACE_HASH",
            ReportField::UserAppStartDate => "USER_APP_START_DATE",
            ReportField::UserCrashDate => "USER_CRASH_DATE",
            ReportField::IsSilent => "IS_SILENT",
            ReportField::CustomData => "CUSTOM_DATA",
            ReportField::Environment => "ENVIRONMENT",
            ReportField::ApplicationLog => "APPLICATION_LOG",
            ReportField::UserComment => "USER_COMMENT",
            ReportField::UserEmail => "USER_EMAIL",
        }
    }
}

impl std::fmt::Display for ReportField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ReportField> for String {
    fn from(field: ReportField) -> Self {
        field.as_str().to_string()
    }
}

// ============================================
// Report
// ============================================

/// The unit of work: one failure occurrence and everything collected about it.
///
/// `fields` keeps insertion order so a serialized report reads in tier order,
/// but lookup is always by key. Overwriting an existing key keeps its
/// original position and replaces the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Creation time; also encoded in the persisted file name
    pub timestamp: DateTime<Utc>,
    /// Generated without user interaction
    pub is_silent: bool,
    /// Collected fields
    pub fields: Map<String, Value>,
}

impl Report {
    /// Create an empty report.
    pub fn new(timestamp: DateTime<Utc>, is_silent: bool) -> Self {
        Self {
            timestamp,
            is_silent,
            fields: Map::new(),
        }
    }

    /// Set a field, replacing any previous value under the same key.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Merge collector output; later entries win.
    pub fn merge(&mut self, fields: Vec<(String, Value)>) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
    }

    /// Look up a field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a well-known field as a string.
    pub fn get_str(&self, field: ReportField) -> Option<&str> {
        self.fields.get(field.as_str()).and_then(Value::as_str)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no collector contributed anything
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a persisted report.
    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

// ============================================
// Crash context
// ============================================

/// Everything the host knows about a failure when it happens.
///
/// Collectors read this; they never mutate it. It is shared across the
/// collector worker pool behind an `Arc`.
#[derive(Debug, Clone)]
pub struct CrashContext {
    /// Human-readable failure message
    pub message: Option<String>,
    /// Type of the failure (error type name, `panic`, ...)
    pub exception_class: Option<String>,
    /// Full stack trace text
    pub stack_trace: Option<String>,
    /// Name of the thread that failed
    pub thread_name: Option<String>,
    /// Report without user interaction
    pub is_silent: bool,
    /// The failure will terminate the host process
    pub is_uncaught: bool,
    /// When the failure happened
    pub occurred_at: DateTime<Utc>,
    /// Per-report custom key/values (win over global custom data)
    pub custom_data: BTreeMap<String, String>,
}

impl Default for CrashContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashContext {
    /// Empty context stamped with the current time and thread.
    pub fn new() -> Self {
        Self {
            message: None,
            exception_class: None,
            stack_trace: None,
            thread_name: std::thread::current().name().map(str::to_string),
            is_silent: false,
            is_uncaught: false,
            occurred_at: Utc::now(),
            custom_data: BTreeMap::new(),
        }
    }

    /// Build a context from any error value.
    ///
    /// The exception class is the error's type name; the stack trace lists
    /// the source chain followed by a captured backtrace.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let class = std::any::type_name::<E>();
        let mut trace = format!("{}: {}", class, error);
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push_str(&format!("\nCaused by: {}", cause));
            source = cause.source();
        }
        trace.push('\n');
        trace.push_str(&Backtrace::force_capture().to_string());

        Self::new()
            .with_message(error.to_string())
            .with_exception(class, trace)
    }

    /// Build a context from a panic, marked uncaught.
    pub fn from_panic(info: &std::panic::PanicHookInfo<'_>) -> Self {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "Box<dyn Any>".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "<unknown>".to_string());
        let trace = format!(
            "panicked at {}: {}\n{}",
            location,
            message,
            Backtrace::force_capture()
        );

        let mut ctx = Self::new()
            .with_message(message)
            .with_exception("panic", trace);
        ctx.is_uncaught = true;
        ctx
    }

    /// Set the failure message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the exception class and stack trace.
    pub fn with_exception(mut self, class: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        self.exception_class = Some(class.into());
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Mark the report as generated without user interaction.
    pub fn silent(mut self) -> Self {
        self.is_silent = true;
        self
    }

    /// Attach a per-report custom value.
    pub fn with_custom_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_data.insert(key.into(), value.into());
        self
    }

    /// Override the occurrence time.
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

// ============================================
// Collector tiers
// ============================================

/// Priority tier of a collector.
///
/// Tiers run strictly in declaration order; collectors in a later tier
/// overwrite same-named fields from earlier tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectorOrder {
    First,
    Early,
    Normal,
    Late,
    Last,
}

impl CollectorOrder {
    /// All tiers in execution order
    pub const ALL: [CollectorOrder; 5] = [
        CollectorOrder::First,
        CollectorOrder::Early,
        CollectorOrder::Normal,
        CollectorOrder::Late,
        CollectorOrder::Last,
    ];

    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorOrder::First => "first",
            CollectorOrder::Early => "early",
            CollectorOrder::Normal => "normal",
            CollectorOrder::Late => "late",
            CollectorOrder::Last => "last",
        }
    }
}

impl std::fmt::Display for CollectorOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
