use std::time::Duration;

use thiserror::Error;

/// Failures talking to a remote host.
///
/// Malformed project database lines are not represented here: the parser drops
/// them silently.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Network, handshake, host-key or authentication failure opening a session.
    #[error("cannot connect to {host}: {message}")]
    Connection { host: String, message: String },

    /// The local key generator failed.
    #[error("key generation failed: {0}")]
    Keygen(String),

    /// Opening a channel, running a command, or reading its output failed.
    #[error("remote command failed: {0}")]
    Execution(String),

    /// A single-shot command exceeded its deadline.
    #[error("remote command timed out after {:.1}s: {command}", .after.as_secs_f64())]
    Timeout { command: String, after: Duration },

    /// An existence or creation check came back negative or unreadable.
    #[error("{0}")]
    Probe(String),
}

impl RemoteError {
    pub fn connection(host: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn execution(message: impl ToString) -> Self {
        Self::Execution(message.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// libssh2 `LIBSSH2_ERROR_TIMEOUT`.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

pub(crate) fn is_ssh_timeout(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
}
