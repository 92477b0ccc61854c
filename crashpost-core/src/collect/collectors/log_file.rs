//! Tail of the host application's log file

use crate::collect::FieldCollector;
use crate::error::Result;
use crate::types::{CollectorOrder, CrashContext, ReportField};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

/// Upper bound on the tail length, whatever the configuration asks for.
pub const MAX_LOG_LINES: usize = 2_000;

/// Emits APPLICATION_LOG with the last `lines` lines of a log file.
///
/// I/O bound, so it runs in the LAST tier where a slow disk only costs the
/// per-collector timeout.
pub struct LogFileCollector {
    path: PathBuf,
    lines: usize,
}

impl LogFileCollector {
    pub fn new(path: PathBuf, lines: usize) -> Self {
        Self {
            path,
            lines: lines.min(MAX_LOG_LINES),
        }
    }
}

impl FieldCollector for LogFileCollector {
    fn name(&self) -> &str {
        "log_file"
    }

    fn order(&self) -> CollectorOrder {
        CollectorOrder::Last
    }

    fn enabled(&self, _ctx: &CrashContext) -> bool {
        self.lines > 0 && self.path.is_file()
    }

    fn collect(&self, _ctx: &CrashContext) -> Result<Vec<(String, Value)>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut tail = VecDeque::with_capacity(self.lines);

        // Lines that are not valid UTF-8 are kept, lossily decoded.
        for line in reader.split(b'\n') {
            let mut line = line?;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if tail.len() == self.lines {
                tail.pop_front();
            }
            tail.push_back(String::from_utf8_lossy(&line).into_owned());
        }

        let text = tail.into_iter().collect::<Vec<_>>().join("\n");
        Ok(vec![(ReportField::ApplicationLog.into(), json!(text))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tail_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let content: Vec<String> = (1..=10).map(|i| format!("line {i}")).collect();
        std::fs::write(&path, content.join("\n")).unwrap();

        let collector = LogFileCollector::new(path, 3);
        assert!(collector.enabled(&CrashContext::new()));
        let fields = collector.collect(&CrashContext::new()).unwrap();

        assert_eq!(fields[0].0, "APPLICATION_LOG");
        assert_eq!(fields[0].1, json!("line 8\nline 9\nline 10"));
    }

    #[test]
    fn test_invalid_utf8_line_keeps_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let mut content = b"started\r\n".to_vec();
        content.extend_from_slice(b"bad \xff\xfe bytes\n");
        content.extend_from_slice(b"crashed");
        std::fs::write(&path, content).unwrap();

        let fields = LogFileCollector::new(path, 3)
            .collect(&CrashContext::new())
            .unwrap();

        assert_eq!(
            fields[0].1,
            json!("started\nbad \u{fffd}\u{fffd} bytes\ncrashed")
        );
    }

    #[test]
    fn test_line_count_is_clamped() {
        let collector = LogFileCollector::new(PathBuf::from("app.log"), usize::MAX);
        assert_eq!(collector.lines, MAX_LOG_LINES);
    }

    #[test]
    fn test_missing_file_self_excludes() {
        let collector = LogFileCollector::new(PathBuf::from("/nonexistent/crashpost.log"), 10);
        assert!(!collector.enabled(&CrashContext::new()));
    }
}
