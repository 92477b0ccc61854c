//! Stack trace collector
//!
//! Records the failure's stack trace and a stable fingerprint of it. The
//! fingerprint is what the rate limiter counts, so it ignores the parts of
//! a trace that change between builds or runs of the same failure: frame
//! indices, line/column numbers and memory addresses.

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, ReportField};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Emits MESSAGE, EXCEPTION_CLASS, STACK_TRACE and STACK_TRACE_HASH.
pub struct StacktraceCollector;

impl FieldCollector for StacktraceCollector {
    fn name(&self) -> &str {
        "stacktrace"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::First
    }

    fn collect(&self, ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        let mut fields: Vec<(String, Value)> = Vec::with_capacity(4);

        if let Some(message) = &ctx.message {
            fields.push((ReportField::Message.into(), json!(message)));
        }
        if let Some(class) = &ctx.exception_class {
            fields.push((ReportField::ExceptionClass.into(), json!(class)));
        }
        if let Some(trace) = &ctx.stack_trace {
            fields.push((ReportField::StackTrace.into(), json!(trace)));
            fields.push((ReportField::StackTraceHash.into(), json!(stack_trace_hash(trace))));
        }

        Ok(fields)
    }
}

/// Strip the run-specific parts of a stack trace.
pub fn normalize_stack_trace(trace: &str) -> String {
    trace
        .lines()
        .map(normalize_line)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 (hex) of the normalized stack trace.
pub fn stack_trace_hash(trace: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_stack_trace(trace).as_bytes());
    hex::encode(hasher.finalize())
}

fn normalize_line(line: &str) -> String {
    let line = line.trim();

    // Frame index: "12: std::panicking::begin_panic"
    let line = match line.split_once(": ") {
        Some((index, rest)) if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => {
            rest
        }
        _ => line,
    };

    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '0' && chars.peek() == Some(&'x') {
            chars.next();
            while chars.peek().is_some_and(|h| h.is_ascii_hexdigit()) {
                chars.next();
            }
            continue;
        }
        if c == ':' && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
            while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                chars.next();
            }
            continue;
        }
        out.push(c);
    }

    out.trim().to_string()
}
