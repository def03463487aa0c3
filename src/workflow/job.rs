//! Per-workspace archive job and its status machine.
//!
//! ```text
//! Pending -> CheckingBasePath -> CheckingArchiveDir -> CheckingArchiveFile
//!         -> [Formatting] -> Archiving -> Done
//! ```
//! Any non-terminal status may move to `Error`. `Done` and `Error` are terminal.

use std::fmt;

use chrono::Local;
use serde::Serialize;
use thiserror::Error;

use crate::flame;

use super::WorkspaceRef;

/// Format of the timestamp prefixed to start/finish notes.
pub const NOTE_TIME_FORMAT: &str = "%Y/%m/%d %I:%M:%S %p";

pub const NOTE_CONNECTION_FAILED: &str = "connection failed";
pub const NOTE_BASE_PATH_MISSING: &str = "base path not found";
pub const NOTE_ARCHIVE_DIR_FAILED: &str = "archive directory creation failed";
pub const NOTE_FORMAT_FAILED: &str = "error formatting archive";
pub const NOTE_ARCHIVE_FAILED: &str = "error archiving workspace";
pub const NOTE_UNKNOWN_HOST: &str = "host not configured";
pub const NOTE_INTERRUPTED: &str = "skipped: interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    #[serde(rename = "CHECKING_BASEPATH")]
    CheckingBasePath,
    CheckingArchiveDir,
    CheckingArchiveFile,
    Formatting,
    Archiving,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::CheckingBasePath => "CHECKING_BASEPATH",
            JobStatus::CheckingArchiveDir => "CHECKING_ARCHIVE_DIR",
            JobStatus::CheckingArchiveFile => "CHECKING_ARCHIVE_FILE",
            JobStatus::Formatting => "FORMATTING",
            JobStatus::Archiving => "ARCHIVING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Error)
                | (Pending, CheckingBasePath)
                | (CheckingBasePath, CheckingArchiveDir)
                | (CheckingArchiveDir, CheckingArchiveFile)
                | (CheckingArchiveFile, Formatting)
                | (CheckingArchiveFile, Archiving)
                | (Formatting, Archiving)
                | (Archiving, Done)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// One workspace selected for archiving.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveJob {
    pub target: WorkspaceRef,
    pub job_name: String,
    status: JobStatus,
    note: String,
    #[serde(skip)]
    history: Vec<JobStatus>,
}

impl ArchiveJob {
    pub fn new(target: WorkspaceRef) -> Self {
        let job_name = flame::job_name(&target.project).to_string();
        Self {
            target,
            job_name,
            status: JobStatus::Pending,
            note: String::new(),
            history: vec![JobStatus::Pending],
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    /// Every status this job has been in, oldest first.
    pub fn history(&self) -> &[JobStatus] {
        &self.history
    }

    pub fn set_note(&mut self, note: impl Into<String>) {
        self.note = note.into();
    }

    /// Set `note` prefixed with the local time.
    pub fn stamp_note(&mut self, note: &str) {
        self.note = format!("[{}] {}", Local::now().format(NOTE_TIME_FORMAT), note);
    }

    pub fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(
            host = %self.target.host,
            project = %self.target.project,
            workspace = %self.target.workspace,
            from = %self.status,
            to = %next,
            "job transition"
        );
        self.status = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Error` with `note`. A job that already finished is left untouched.
    pub fn fail(&mut self, note: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Error;
        self.history.push(JobStatus::Error);
        self.note = note.to_string();
    }

    /// `<base>/<job>/<host>/<project>`.
    pub fn archive_dir(&self, base_path: &str) -> String {
        remote_join(&[
            base_path,
            &self.job_name,
            &self.target.host,
            &self.target.project,
        ])
    }

    /// `<archive dir>/<project>`.
    pub fn archive_file(&self, base_path: &str) -> String {
        remote_join(&[&self.archive_dir(base_path), &self.target.project])
    }
}

/// Join POSIX path parts on the remote side.
///
/// Empty parts are skipped and an absolute part restarts the path.
pub fn remote_join(parts: &[&str]) -> String {
    let mut path = String::new();
    for part in parts.iter().filter(|p| !p.is_empty()) {
        if part.starts_with('/') {
            path.clear();
        } else if !path.is_empty() && !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(part);
    }
    if path.len() > 1 {
        let trimmed = path.trim_end_matches('/');
        path.truncate(trimmed.len().max(1));
    }
    path
}
