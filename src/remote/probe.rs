//! Remote filesystem preconditions: existence checks and directory creation.

use std::time::Duration;

use super::error::RemoteError;
use super::exec::run_once;
use super::session::RemoteSession;
use crate::console::Console;
use crate::flame::commands;

/// What kind of filesystem entry a probe expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Dir,
}

/// Existence checks against a session, reporting negatives to a console.
pub struct RemoteFsProbe<'a> {
    console: &'a dyn Console,
    timeout: Option<Duration>,
}

impl<'a> RemoteFsProbe<'a> {
    pub fn new(console: &'a dyn Console, timeout: Option<Duration>) -> Self {
        Self { console, timeout }
    }

    /// Ask the remote shell whether `path` exists as `kind`.
    ///
    /// `Ok(true)`/`Ok(false)` for a literal `1`/`0`; anything else is an error.
    pub fn check(
        &self,
        session: &mut dyn RemoteSession,
        path: &str,
        kind: PathKind,
    ) -> Result<bool, RemoteError> {
        let command = match kind {
            PathKind::File => commands::file_exists(path),
            PathKind::Dir => commands::dir_exists(path),
        };
        let out = run_once(session, &command, self.timeout)?;
        match out.stdout.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(RemoteError::Probe(format!(
                "unexpected probe output for {path}: {other:?} {}",
                out.stderr.trim()
            ))),
        }
    }

    /// Like [`check`](Self::check), but every negative or failed outcome becomes
    /// `false` and `failure_msg` is written to the console.
    pub fn exists(
        &self,
        session: &mut dyn RemoteSession,
        path: &str,
        kind: PathKind,
        failure_msg: &str,
    ) -> bool {
        match self.check(session, path, kind) {
            Ok(true) => true,
            Ok(false) => {
                self.console.err(failure_msg);
                false
            }
            Err(e) => {
                tracing::warn!(host = %session.host(), path, error = %e, "probe failed");
                self.console.err(failure_msg);
                self.console.err(&e.to_string());
                false
            }
        }
    }

    /// Create `path` (and parents), then re-probe. The re-probe decides the
    /// result, not the exit status of `mkdir`.
    pub fn ensure_dir(
        &self,
        session: &mut dyn RemoteSession,
        path: &str,
        failure_msg: &str,
    ) -> bool {
        match run_once(session, &commands::create_dir(path), self.timeout) {
            Ok(out) if !out.success() => {
                tracing::debug!(
                    host = %session.host(),
                    path,
                    stderr = %out.stderr.trim(),
                    "mkdir reported failure; re-probing"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(host = %session.host(), path, error = %e, "mkdir failed; re-probing");
            }
        }
        self.exists(session, path, PathKind::Dir, failure_msg)
    }
}
