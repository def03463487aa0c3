//! Running commands on a [`RemoteSession`].
//!
//! Two modes:
//! - [`run_once`]: capture stdout and stderr separately, with an optional deadline.
//!   Used for listing, probing, estimating and formatting.
//! - [`run_streamed`]: run under a PTY so stdout and stderr arrive merged in the
//!   order a terminal would show them, and yield lines as they arrive. Used for
//!   the archive command.

use std::io::{BufRead, BufReader, ErrorKind};
use std::time::Duration;

use super::error::RemoteError;
use super::session::{CommandOutput, PtyStream, RemoteSession};

/// Line prefixes the archive tool prints on connect; not worth showing.
pub const NOISE_PREFIXES: &[&str] = &["Registered", "Connected"];

/// True for blank lines and tool banners.
pub fn is_banner_noise(line: &str) -> bool {
    line.trim().is_empty() || NOISE_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Run `command` to completion.
pub fn run_once(
    session: &mut dyn RemoteSession,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput, RemoteError> {
    tracing::debug!(host = %session.host(), command, ?timeout, "run_once");
    session.exec(command, timeout)
}

/// Start `command` under a PTY and return its output as lines.
pub fn run_streamed(
    session: &mut dyn RemoteSession,
    command: &str,
) -> Result<LineStream, RemoteError> {
    tracing::debug!(host = %session.host(), command, "run_streamed");
    let stream = session.exec_pty(command)?;
    Ok(LineStream::new(stream))
}

/// Single-pass iterator over the lines of a PTY stream.
///
/// Line endings (`\n`, `\r\n`) are stripped. After an I/O error the stream ends.
/// Call [`LineStream::finish`] once drained to collect the exit status.
pub struct LineStream {
    reader: BufReader<Box<dyn PtyStream>>,
    buf: Vec<u8>,
    done: bool,
}

impl LineStream {
    pub fn new(stream: Box<dyn PtyStream>) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::with_capacity(256),
            done: false,
        }
    }

    /// Wait for the command to exit and return its status.
    pub fn finish(self) -> Result<Option<i32>, RemoteError> {
        self.reader.into_inner().finish()
    }
}

impl Iterator for LineStream {
    type Item = Result<String, RemoteError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buf.clear();
        loop {
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    return Some(Ok(line.trim_end_matches(['\r', '\n']).to_string()));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(RemoteError::execution(format!(
                        "reading command output: {e}"
                    ))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::test_support::{FakePty, QueueSession};

    #[test]
    fn test_banner_noise() {
        assert!(is_banner_noise(""));
        assert!(is_banner_noise("   "));
        assert!(is_banner_noise("Registered with server"));
        assert!(is_banner_noise("Connected to localhost"));
        assert!(!is_banner_noise("Archiving clip 3 of 12"));
        assert!(!is_banner_noise("  Registered later in the line is kept"));
    }

    #[test]
    fn test_lines_are_split_and_trimmed() {
        let pty = FakePty::new(b"Connected\r\nline one\r\n\r\nline two\nno newline", 0);
        let mut stream = LineStream::new(Box::new(pty));
        let lines: Vec<String> = stream.by_ref().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["Connected", "line one", "", "line two", "no newline"]);
        assert_eq!(stream.finish().unwrap(), Some(0));
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let pty = FakePty::new(b"ok \xff here\n", 0);
        let lines: Vec<_> = LineStream::new(Box::new(pty)).map(Result::unwrap).collect();
        assert_eq!(lines, vec!["ok \u{fffd} here"]);
    }

    #[test]
    fn test_read_error_ends_stream() {
        let pty = FakePty::new(b"first\n", 0).fail_after_data();
        let mut stream = LineStream::new(Box::new(pty));
        assert_eq!(stream.next().unwrap().unwrap(), "first");
        assert!(matches!(stream.next(), Some(Err(RemoteError::Execution(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_run_streamed_reports_exit_status() {
        let mut session = QueueSession::new("render01");
        session.push_pty(b"Registered\nworking\n", 3);
        let mut stream = run_streamed(&mut session, "flame_archive -v").unwrap();
        let shown: Vec<String> = stream
            .by_ref()
            .map(Result::unwrap)
            .filter(|l| !is_banner_noise(l))
            .collect();
        assert_eq!(shown, vec!["working"]);
        assert_eq!(stream.finish().unwrap(), Some(3));
        assert_eq!(session.commands, vec!["flame_archive -v"]);
    }

    #[test]
    fn test_run_once_passes_through() {
        let mut session = QueueSession::new("render01");
        session.push_ok("1\n");
        let out = run_once(&mut session, "echo 1", Some(Duration::from_secs(1))).unwrap();
        assert_eq!(out.stdout, "1\n");
        assert!(out.success());
    }
}
