//! Archive orchestration across configured hosts.
//!
//! [`ArchiveWorkflow`] drives the three user operations:
//!
//! - **list**: dump each enabled host's project database, parse it, and list the
//!   workspaces of every project
//! - **estimate**: ask the archive tool how large each selected workspace would be
//! - **archive**: run each selected workspace through the [`ArchiveJob`] status
//!   machine (probe base path, prepare the archive directory, format the archive
//!   file when missing, stream the archive command)
//!
//! Work is strictly sequential with one session open at a time. Every failure is
//! contained to the job or host it happened on; processing continues with the
//! next one. Each target is an independent unit of work (`run_job`,
//! `estimate_one`, `list_host`).

pub mod job;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{HostConfig, HostSet};
use crate::console::Console;
use crate::flame::{self, commands};
use crate::remote::{
    Connector, PathKind, RemoteError, RemoteFsProbe, RemoteSession, SessionGuard,
    is_banner_noise, run_once, run_streamed,
};

pub use job::{ArchiveJob, JobStatus, TransitionError};

use job::{
    NOTE_ARCHIVE_DIR_FAILED, NOTE_ARCHIVE_FAILED, NOTE_BASE_PATH_MISSING, NOTE_CONNECTION_FAILED,
    NOTE_FORMAT_FAILED, NOTE_INTERRUPTED, NOTE_UNKNOWN_HOST,
};

/// Size reported when the estimate command prints nothing.
pub const EMPTY_ESTIMATE: &str = "0 GB";

/// One workspace on one host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub host: String,
    pub project: String,
    pub workspace: String,
}

impl WorkspaceRef {
    pub fn new(
        host: impl Into<String>,
        project: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            project: project.into(),
            workspace: workspace.into(),
        }
    }
}

impl fmt::Display for WorkspaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.project, self.workspace)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid target {input:?}: expected HOST:PROJECT:WORKSPACE")]
pub struct TargetParseError {
    pub input: String,
}

impl FromStr for WorkspaceRef {
    type Err = TargetParseError;

    /// `host:project:workspace`; the workspace keeps any further colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(project), Some(workspace))
                if !host.is_empty() && !project.is_empty() && !workspace.is_empty() =>
            {
                Ok(Self::new(host, project, workspace))
            }
            _ => Err(TargetParseError {
                input: s.to_string(),
            }),
        }
    }
}

/// Result of a listing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingReport {
    /// Discovered workspaces, in host then database order.
    pub workspaces: Vec<WorkspaceRef>,
    /// Hosts that could not be listed (fully or partially).
    pub failed_hosts: Vec<String>,
}

/// Estimated archive size of one workspace; `None` when estimation failed or
/// was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizeEstimate {
    pub target: WorkspaceRef,
    pub size: Option<String>,
}

/// Trimmed estimate output, or [`EMPTY_ESTIMATE`] when there is none.
pub fn normalize_size(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        EMPTY_ESTIMATE.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sequential list / estimate / archive over a host set.
pub struct ArchiveWorkflow<'a> {
    hosts: &'a HostSet,
    connector: &'a dyn Connector,
    console: &'a dyn Console,
    timeout: Option<Duration>,
    stop: Option<Arc<AtomicBool>>,
}

impl<'a> ArchiveWorkflow<'a> {
    pub fn new(hosts: &'a HostSet, connector: &'a dyn Connector, console: &'a dyn Console) -> Self {
        Self {
            hosts,
            connector,
            console,
            timeout: None,
            stop: None,
        }
    }

    /// Deadline for single-shot commands that are expected to be quick
    /// (database dump, probes, format).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Checked between jobs; once set, remaining jobs are skipped.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn interrupted(&self) -> bool {
        self.stop
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Open a key-authenticated session, reporting failure to the console.
    fn open(&self, host: &HostConfig) -> Option<SessionGuard> {
        match self.connector.connect(&host.name, &host.user, None) {
            Ok(session) => Some(SessionGuard::new(session)),
            Err(e) => {
                tracing::warn!(host = %host.name, error = %e, "connection failed");
                self.console.err(&format!("{}: CANNOT CONNECT!", host.name));
                self.console.err(&e.to_string());
                None
            }
        }
    }

    fn host_for(&self, target: &WorkspaceRef) -> Option<&'a HostConfig> {
        let host = self.hosts.get(&target.host);
        if host.is_none() {
            tracing::warn!(host = %target.host, "target host is not configured");
            self.console
                .err(&format!("{}: host is not configured", target.host));
        }
        host
    }

    // ---------------------------------------------------------------------
    // Listing
    // ---------------------------------------------------------------------

    /// List the workspaces of every project on every enabled host.
    pub fn list_projects(&self) -> ListingReport {
        let mut report = ListingReport::default();

        for host in self.hosts.enabled() {
            if self.interrupted() {
                break;
            }
            self.console.host_header(&host.name);

            let Some(mut guard) = self.open(host) else {
                report.failed_hosts.push(host.name.clone());
                continue;
            };
            let before = report.workspaces.len();
            if let Err(e) = self.list_host(guard.session(), &mut report.workspaces) {
                tracing::warn!(host = %host.name, error = %e, "project listing failed");
                self.console
                    .err(&format!("{}: PROJECT LISTING FAILED!", host.name));
                self.console.err(&e.to_string());
                report.failed_hosts.push(host.name.clone());
            }
            guard.close();
            tracing::info!(
                host = %host.name,
                workspaces = report.workspaces.len() - before,
                "host listed"
            );
        }

        self.console.banner("Project Listing Complete");
        report
    }

    /// Workspaces found so far stay in `out` when a later command fails.
    fn list_host(
        &self,
        session: &mut dyn RemoteSession,
        out: &mut Vec<WorkspaceRef>,
    ) -> Result<(), RemoteError> {
        let host = session.host().to_string();
        let dump = run_once(session, &commands::list_project_db(), self.timeout)?;
        if !dump.success() {
            return Err(RemoteError::execution(format!(
                "{} exited with {}: {}",
                commands::list_project_db(),
                dump.exit_status.unwrap_or(-1),
                dump.stderr.trim()
            )));
        }

        for record in flame::parse_project_db(&dump.stdout) {
            let Some(partition) = record.partition() else {
                tracing::warn!(host = %host, project = %record.name, "no partition; skipped");
                self.console.err(&format!(
                    "{}: project {} has no partition, skipped",
                    host, record.name
                ));
                continue;
            };

            // grep exits non-zero when a project has no workspaces; only stdout matters.
            let listing = run_once(
                session,
                &commands::list_workspaces(partition, &record.name),
                None,
            )?;
            for workspace in listing.stdout.lines().filter_map(flame::workspace_from_entry) {
                self.console
                    .out(&format!("{} / {}", record.name, workspace));
                out.push(WorkspaceRef::new(&host, &record.name, workspace));
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Size estimation
    // ---------------------------------------------------------------------

    /// Estimate each target in order. Failed or skipped targets have no size.
    pub fn estimate(&self, targets: &[WorkspaceRef]) -> Vec<SizeEstimate> {
        self.console.banner("Calculating Size...");

        let mut estimates = Vec::with_capacity(targets.len());
        for target in targets {
            let size = if self.interrupted() {
                None
            } else {
                self.estimate_one(target)
            };
            estimates.push(SizeEstimate {
                target: target.clone(),
                size,
            });
        }

        self.console.banner("Size Estimate Complete");
        estimates
    }

    fn estimate_one(&self, target: &WorkspaceRef) -> Option<String> {
        let host = self.host_for(target)?;
        self.console.host_header(&host.name);
        let mut guard = self.open(host)?;

        let command = commands::estimate_archive(&target.project, &target.workspace);
        self.console.out(&format!("{}: {}", host.name, command));

        // The estimate walks the whole workspace; no deadline.
        let result = run_once(guard.session(), &command, None);
        guard.close();

        match result {
            Ok(out) => {
                let size = normalize_size(&out.stdout);
                self.console.ok(&size);
                tracing::debug!(workspace = %target, size = %size, "estimated");
                Some(size)
            }
            Err(e) => {
                tracing::warn!(workspace = %target, error = %e, "estimate failed");
                self.console
                    .err(&format!("{}: ERROR ESTIMATING: {}", host.name, target.project));
                self.console.err(&e.to_string());
                None
            }
        }
    }

    // ---------------------------------------------------------------------
    // Archiving
    // ---------------------------------------------------------------------

    /// Archive each target in order and return the finished jobs.
    ///
    /// Jobs left unstarted by an interruption stay `Pending`.
    pub fn archive(&self, targets: &[WorkspaceRef]) -> Vec<ArchiveJob> {
        let mut jobs: Vec<ArchiveJob> = targets.iter().cloned().map(ArchiveJob::new).collect();

        for job in jobs.iter_mut() {
            if self.interrupted() {
                job.set_note(NOTE_INTERRUPTED);
                continue;
            }
            match self.host_for(&job.target) {
                Some(host) => self.run_job(job, host),
                None => job.fail(NOTE_UNKNOWN_HOST),
            }
        }

        self.console.banner("Archiving Complete");
        jobs
    }

    /// Run one job to a terminal status. The session is closed before returning.
    pub fn run_job(&self, job: &mut ArchiveJob, host: &HostConfig) {
        self.console.host_header(&host.name);
        job.stamp_note("Archiving Started");

        let Some(mut guard) = self.open(host) else {
            job.fail(NOTE_CONNECTION_FAILED);
            return;
        };

        if let Err(e) = self.drive(job, host, guard.session()) {
            tracing::error!(workspace = %job.target, error = %e, "job state machine misuse");
            self.console.err(&e.to_string());
            job.fail(NOTE_ARCHIVE_FAILED);
        }
        guard.close();

        if job.status() == JobStatus::Archiving {
            // Only reachable once the stream ended cleanly.
            if job.advance(JobStatus::Done).is_ok() {
                job.stamp_note("Archiving Finished");
                tracing::info!(workspace = %job.target, "archived");
            }
        }
    }

    /// Walk the job from `Pending` to `Archiving`, or to `Error` on the first
    /// failed step. Failures are recorded on the job; `Err` means a status
    /// transition was attempted out of order.
    fn drive(
        &self,
        job: &mut ArchiveJob,
        host: &HostConfig,
        session: &mut dyn RemoteSession,
    ) -> Result<(), TransitionError> {
        let probe = RemoteFsProbe::new(self.console, self.timeout);
        let base_path = host.base_path.as_str();

        job.advance(JobStatus::CheckingBasePath)?;
        if !probe.exists(
            session,
            base_path,
            PathKind::Dir,
            &format!("Base Path not found: {}", base_path),
        ) {
            tracing::warn!(workspace = %job.target, base_path, "base path not found");
            job.fail(NOTE_BASE_PATH_MISSING);
            return Ok(());
        }

        job.advance(JobStatus::CheckingArchiveDir)?;
        let archive_dir = job.archive_dir(base_path);
        let dir_ready = probe.exists(
            session,
            &archive_dir,
            PathKind::Dir,
            &format!("Archive Directory not found: {}", archive_dir),
        ) || probe.ensure_dir(
            session,
            &archive_dir,
            &format!("Archive Directory Creation failed: {}", archive_dir),
        );
        if !dir_ready {
            tracing::warn!(
                workspace = %job.target,
                archive_dir = %archive_dir,
                "archive directory creation failed"
            );
            job.fail(NOTE_ARCHIVE_DIR_FAILED);
            return Ok(());
        }

        job.advance(JobStatus::CheckingArchiveFile)?;
        let archive_file = job.archive_file(base_path);
        if !probe.exists(
            session,
            &archive_file,
            PathKind::File,
            &format!("Archive File not found: {}", archive_file),
        ) {
            job.advance(JobStatus::Formatting)?;
            if !self.format(session, &archive_file) {
                self.console
                    .err(&format!("{}: ERROR FORMATTING: {}", host.name, archive_file));
                job.fail(NOTE_FORMAT_FAILED);
                return Ok(());
            }
        }

        job.advance(JobStatus::Archiving)?;
        if let Err(e) = self.stream_archive(session, job, &archive_file) {
            tracing::warn!(workspace = %job.target, error = %e, "archive failed");
            self.console
                .err(&format!("{}: ERROR ARCHIVING: {}", host.name, archive_file));
            self.console.err(&e.to_string());
            job.fail(NOTE_ARCHIVE_FAILED);
        }
        Ok(())
    }

    fn format(&self, session: &mut dyn RemoteSession, archive_file: &str) -> bool {
        let command = commands::format_archive(archive_file);
        self.console.out(&format!("{}: {}", session.host(), command));

        match run_once(session, &command, self.timeout) {
            Ok(out) => {
                if !out.stdout.trim().is_empty() {
                    self.console.ok(out.stdout.trim());
                }
                if !out.stderr.trim().is_empty() {
                    self.console.err(out.stderr.trim());
                }
                if !out.success() {
                    tracing::warn!(
                        host = %session.host(),
                        file = archive_file,
                        status = ?out.exit_status,
                        "format exited non-zero"
                    );
                }
                out.success()
            }
            Err(e) => {
                tracing::warn!(host = %session.host(), file = archive_file, error = %e, "format failed");
                self.console.err(&e.to_string());
                false
            }
        }
    }

    /// Stream the archive command, forwarding each meaningful line as it arrives.
    fn stream_archive(
        &self,
        session: &mut dyn RemoteSession,
        job: &ArchiveJob,
        archive_file: &str,
    ) -> Result<(), RemoteError> {
        let command = commands::archive(archive_file, &job.target.project, &job.target.workspace);
        self.console.out(&format!("{}: {}", session.host(), command));

        let mut lines = run_streamed(session, &command)?;
        for line in lines.by_ref() {
            let line = line?;
            if !is_banner_noise(&line) {
                self.console.ok(line.trim());
            }
        }
        match lines.finish()? {
            Some(code) if code != 0 => Err(RemoteError::execution(format!(
                "archive tool exited with status {code}"
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::console::{Level, MemoryConsole};
    use crate::remote::test_support::QueueSession;

    struct QueueConnector {
        sessions: RefCell<VecDeque<Result<QueueSession, RemoteError>>>,
    }

    impl QueueConnector {
        fn new(sessions: Vec<Result<QueueSession, RemoteError>>) -> Self {
            Self {
                sessions: RefCell::new(sessions.into()),
            }
        }
    }

    impl Connector for QueueConnector {
        fn connect(
            &self,
            host: &str,
            _user: &str,
            password: Option<&str>,
        ) -> Result<Box<dyn RemoteSession>, RemoteError> {
            assert!(password.is_none(), "workflow must use key auth");
            match self.sessions.borrow_mut().pop_front() {
                Some(Ok(session)) => Ok(Box::new(session)),
                Some(Err(e)) => Err(e),
                None => Err(RemoteError::connection(host, "nothing scripted")),
            }
        }
    }

    fn hosts() -> HostSet {
        let mut hosts = HostSet::default();
        hosts
            .add(HostConfig::new("render01", "artist", "/mnt/archive"))
            .unwrap();
        hosts
    }

    #[test]
    fn test_target_parsing() {
        let target: WorkspaceRef = "render01:SHOW01_edit:Main:v2".parse().unwrap();
        assert_eq!(target, WorkspaceRef::new("render01", "SHOW01_edit", "Main:v2"));
        assert_eq!(target.to_string(), "render01:SHOW01_edit:Main:v2");

        for bad in ["", "render01", "render01:SHOW01", ":p:w", "h::w", "h:p:"] {
            assert!(bad.parse::<WorkspaceRef>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_normalize_size() {
        assert_eq!(normalize_size(""), "0 GB");
        assert_eq!(normalize_size(" \n"), "0 GB");
        assert_eq!(normalize_size("  12.4 GB\n"), "12.4 GB");
    }

    #[test]
    fn test_reference_job_sequence() {
        let mut session = QueueSession::new("render01");
        session.push_ok("1\n"); // base path
        session.push_ok("0\n"); // archive dir
        session.push_ok("1\n"); // mkdir
        session.push_ok("1\n"); // archive dir, again
        session.push_ok("0\n"); // archive file
        session.push_ok("formatted\n");
        session.push_pty(b"Connected\r\nArchiving Main\r\n\r\ndone\r\n", 0);
        let closed = session.closed_flag();

        let hosts = hosts();
        let connector = QueueConnector::new(vec![Ok(session)]);
        let console = MemoryConsole::new();
        let workflow = ArchiveWorkflow::new(&hosts, &connector, &console);

        let jobs = workflow.archive(&[WorkspaceRef::new("render01", "SHOW01_edit", "Main")]);
        let job = &jobs[0];
        assert_eq!(job.status(), JobStatus::Done, "note: {}", job.note());
        assert!(job.note().ends_with("Archiving Finished"));
        assert_eq!(
            job.history(),
            &[
                JobStatus::Pending,
                JobStatus::CheckingBasePath,
                JobStatus::CheckingArchiveDir,
                JobStatus::CheckingArchiveFile,
                JobStatus::Formatting,
                JobStatus::Archiving,
                JobStatus::Done,
            ]
        );
        assert!(closed.get());

        let ok = console.lines(Level::Ok);
        assert_eq!(ok, vec!["formatted", "Archiving Main", "done"]);
        assert!(console.contains(
            "render01: /opt/Autodesk/io/bin/flame_archive --format --file /mnt/archive/SHOW01/render01/SHOW01_edit/SHOW01_edit"
        ));
    }

    #[test]
    fn test_connection_failure_marks_error_and_continues() {
        let mut second = QueueSession::new("render01");
        second.push_ok("0\n");

        let hosts = hosts();
        let connector = QueueConnector::new(vec![
            Err(RemoteError::connection("render01", "refused")),
            Ok(second),
        ]);
        let console = MemoryConsole::new();
        let workflow = ArchiveWorkflow::new(&hosts, &connector, &console);

        let jobs = workflow.archive(&[
            WorkspaceRef::new("render01", "A_x", "Main"),
            WorkspaceRef::new("render01", "B_x", "Main"),
        ]);
        assert_eq!(jobs[0].note(), job::NOTE_CONNECTION_FAILED);
        assert_eq!(jobs[1].note(), job::NOTE_BASE_PATH_MISSING);
        assert!(console.contains("render01: CANNOT CONNECT!"));
    }

    #[test]
    fn test_unknown_host_and_stop_flag() {
        let hosts = hosts();
        let connector = QueueConnector::new(vec![]);
        let console = MemoryConsole::new();
        let stop = Arc::new(AtomicBool::new(false));
        let workflow =
            ArchiveWorkflow::new(&hosts, &connector, &console).with_stop_flag(Arc::clone(&stop));

        let jobs = workflow.archive(&[WorkspaceRef::new("nowhere", "A_x", "Main")]);
        assert_eq!(jobs[0].status(), JobStatus::Error);
        assert_eq!(jobs[0].note(), job::NOTE_UNKNOWN_HOST);

        stop.store(true, Ordering::SeqCst);
        let jobs = workflow.archive(&[WorkspaceRef::new("render01", "A_x", "Main")]);
        assert_eq!(jobs[0].status(), JobStatus::Pending);
        assert_eq!(jobs[0].note(), job::NOTE_INTERRUPTED);
        assert_eq!(console.lines(Level::Out).last().unwrap(), &"*".repeat(26));
    }
}
