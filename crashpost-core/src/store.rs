//! Durable two-state report queue
//!
//! Reports live as one JSON file each under two fixed directories:
//!
//! ```text
//! <root>/
//! ├── pending/    # collected, waiting for approval
//! │   └── 20261019T101500.123456Z.report
//! └── approved/   # eligible for sending
//!     └── 20261019T093012.000001Z-silent.report
//! ```
//!
//! The file name carries the creation timestamp (ISO-8601 basic format,
//! UTC, microseconds) and the silent flag, so ordering and "only silent"
//! filtering never need to open a file.
//!
//! Nothing is cached in memory: every call reads the directories again,
//! so a store opened by a new process after a crash sees exactly what the
//! previous one left behind. Writes go to a hidden temporary sibling that
//! is fsynced and renamed into place; promotion is a single rename between
//! the two directories.

use crate::error::{Error, Result};
use crate::types::Report;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory holding reports awaiting approval
pub const PENDING_DIR: &str = "pending";

/// Directory holding reports eligible for sending
pub const APPROVED_DIR: &str = "approved";

const REPORT_EXTENSION: &str = ".report";
const SILENT_SUFFIX: &str = "-silent";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y%m%dT%H%M%S%.fZ";

/// Attempts at finding a free file name before giving up
const MAX_NAME_ATTEMPTS: usize = 1_000;

// ============================================
// Handles
// ============================================

/// Queue a report file is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Pending,
    Approved,
}

impl QueueState {
    /// Returns the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Approved => "approved",
        }
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle to one persisted report.
///
/// Handles are plain data; they go stale when the file is promoted or
/// deleted, and every store operation re-checks the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFile {
    /// Full path to the report file
    pub path: PathBuf,
    /// Queue the file was found in
    pub state: QueueState,
    /// Timestamp encoded in the file name
    pub timestamp: DateTime<Utc>,
    /// Silent flag encoded in the file name
    pub is_silent: bool,
}

impl ReportFile {
    /// File name without directory
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Last modification time of the file
    pub fn modified(&self) -> Result<DateTime<Utc>> {
        let modified = fs::metadata(&self.path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn from_path(path: PathBuf, state: QueueState) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Store(format!("invalid report path: {}", path.display())))?;

        match parse_file_name(name) {
            Some((timestamp, is_silent)) => Ok(Self {
                path,
                state,
                timestamp,
                is_silent,
            }),
            None => {
                // Foreign name: order by modification time instead.
                tracing::debug!(file = name, "Report file name has no timestamp");
                let is_silent = name.trim_end_matches(REPORT_EXTENSION).ends_with(SILENT_SUFFIX);
                let timestamp = DateTime::<Utc>::from(fs::metadata(&path)?.modified()?);
                Ok(Self {
                    path,
                    state,
                    timestamp,
                    is_silent,
                })
            }
        }
    }
}

/// Number of reports per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: usize,
    pub approved: usize,
}

impl QueueCounts {
    /// Reports on disk in either queue
    pub fn total(&self) -> usize {
        self.pending + self.approved
    }
}

// ============================================
// File naming
// ============================================

/// Build the file name for a report created at `timestamp`.
pub fn file_name_for(timestamp: DateTime<Utc>, is_silent: bool) -> String {
    format!(
        "{}{}{}",
        timestamp.format(TIMESTAMP_FORMAT),
        if is_silent { SILENT_SUFFIX } else { "" },
        REPORT_EXTENSION
    )
}

/// Recover timestamp and silent flag from a report file name.
pub fn parse_file_name(name: &str) -> Option<(DateTime<Utc>, bool)> {
    let stem = name.strip_suffix(REPORT_EXTENSION)?;
    let (stamp, is_silent) = match stem.strip_suffix(SILENT_SUFFIX) {
        Some(stamp) => (stamp, true),
        None => (stem, false),
    };
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_PARSE_FORMAT).ok()?;
    Some((naive.and_utc(), is_silent))
}

// ============================================
// Store
// ============================================

/// File-backed pending/approved report queue.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
    pending_dir: PathBuf,
    approved_dir: PathBuf,
}

impl ReportStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let pending_dir = root.join(PENDING_DIR);
        let approved_dir = root.join(APPROVED_DIR);
        fs::create_dir_all(&pending_dir)?;
        fs::create_dir_all(&approved_dir)?;

        Ok(Self {
            root,
            pending_dir,
            approved_dir,
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a queue
    pub fn dir(&self, state: QueueState) -> &Path {
        match state {
            QueueState::Pending => &self.pending_dir,
            QueueState::Approved => &self.approved_dir,
        }
    }

    /// Persist a freshly collected report into the pending queue.
    pub fn write_pending(&self, report: &Report) -> Result<ReportFile> {
        let content = report.to_json()?;
        let mut timestamp = report.timestamp;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = file_name_for(timestamp, report.is_silent);
            let path = self.pending_dir.join(&name);
            if path.exists() || self.approved_dir.join(&name).exists() {
                timestamp += Duration::microseconds(1);
                continue;
            }

            write_atomically(&path, content.as_bytes())?;
            tracing::debug!(file = %name, "Wrote pending report");

            return Ok(ReportFile {
                path,
                state: QueueState::Pending,
                timestamp: parse_file_name(&name).map(|(t, _)| t).unwrap_or(timestamp),
                is_silent: report.is_silent,
            });
        }

        Err(Error::Store(format!(
            "no free report file name near {}",
            report.timestamp
        )))
    }

    /// Rewrite a pending report (e.g. to add a user comment).
    pub fn update_pending(&self, file: &ReportFile, report: &Report) -> Result<()> {
        if file.state != QueueState::Pending {
            return Err(Error::Store(format!(
                "only pending reports can be modified: {}",
                file.file_name()
            )));
        }
        if !file.path.exists() {
            return Err(Error::Store(format!(
                "pending report not found: {}",
                file.file_name()
            )));
        }

        write_atomically(&file.path, report.to_json()?.as_bytes())
    }

    /// Move a pending report into the approved queue.
    pub fn promote(&self, file: &ReportFile) -> Result<ReportFile> {
        if file.state != QueueState::Pending {
            return Err(Error::Store(format!(
                "report is not pending: {}",
                file.file_name()
            )));
        }

        let target = self.approved_dir.join(file.file_name());
        if target.exists() {
            return Err(Error::Store(format!(
                "approved report already exists: {}",
                file.file_name()
            )));
        }

        fs::rename(&file.path, &target)?;
        tracing::debug!(file = file.file_name(), "Promoted report to approved");

        Ok(ReportFile {
            path: target,
            state: QueueState::Approved,
            timestamp: file.timestamp,
            is_silent: file.is_silent,
        })
    }

    /// Pending reports, oldest first.
    pub fn list_pending(&self) -> Result<Vec<ReportFile>> {
        self.list(QueueState::Pending)
    }

    /// Approved reports, oldest first.
    pub fn list_approved(&self) -> Result<Vec<ReportFile>> {
        self.list(QueueState::Approved)
    }

    /// Pending followed by approved reports.
    pub fn list_all(&self) -> Result<Vec<ReportFile>> {
        let mut all = self.list_pending()?;
        all.extend(self.list_approved()?);
        Ok(all)
    }

    /// Find a report by file name in either queue.
    pub fn find(&self, name: &str) -> Result<Option<ReportFile>> {
        Ok(self.list_all()?.into_iter().find(|f| f.file_name() == name))
    }

    /// Number of reports per queue.
    pub fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            pending: self.list_pending()?.len(),
            approved: self.list_approved()?.len(),
        })
    }

    /// Read and parse a report.
    pub fn load(&self, file: &ReportFile) -> Result<Report> {
        let content = fs::read_to_string(&file.path)?;
        Report::from_json(&content)
    }

    /// Remove a report. Deleting an already-missing report is not an error.
    pub fn delete(&self, file: &ReportFile) -> Result<()> {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                tracing::debug!(file = file.file_name(), state = %file.state, "Deleted report");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, state: QueueState) -> Result<Vec<ReportFile>> {
        let dir = self.dir(state);
        let dir_str = dir
            .to_str()
            .ok_or_else(|| Error::Store(format!("non UTF-8 report dir: {}", dir.display())))?;
        let pattern = format!(
            "{}/*{}",
            glob::Pattern::escape(dir_str),
            REPORT_EXTENSION
        );

        let paths = glob::glob(&pattern)
            .map_err(|e| Error::Store(format!("invalid report pattern: {}", e)))?;

        let mut files = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) if path.is_file() => match ReportFile::from_path(path, state) {
                    Ok(file) => files.push(file),
                    // Removed between listing and stat (concurrent delete)
                    Err(e) => tracing::debug!(error = %e, "Skipping vanished report file"),
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Unreadable entry in report dir"),
            }
        }

        files.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.file_name().cmp(b.file_name()))
        });
        Ok(files)
    }
}

/// Write `content` to a hidden sibling, fsync, then rename over `path`.
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Store(format!("invalid report path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", name));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
