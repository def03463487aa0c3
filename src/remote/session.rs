//! Remote sessions over SSH.
//!
//! The orchestration layer only sees the narrow [`RemoteSession`] and [`Connector`]
//! traits. [`SessionManager`] is the ssh2-backed implementation: it resolves and
//! connects, records unknown host keys on first use, authenticates with either a
//! password or the application's key pair, and hands out [`SshSession`]s.
//!
//! Agent lookup and `~/.ssh` key discovery are never used; the only identity is
//! the key pair under the application config dir.

use std::fs;
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{CheckResult, KnownHostFileKind};

use super::error::{RemoteError, is_ssh_timeout};
use crate::config::KeyPaths;
use crate::console::Console;
use crate::flame::commands;

/// Captured result of a non-streamed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, when the server reported one.
    pub exit_status: Option<i32>,
}

impl CommandOutput {
    /// A missing exit status counts as success.
    pub fn success(&self) -> bool {
        self.exit_status.is_none_or(|code| code == 0)
    }
}

/// Merged stdout+stderr of a command running under a pseudo-terminal.
pub trait PtyStream: Read {
    /// Wait for the remote side to close and return its exit status.
    fn finish(&mut self) -> Result<Option<i32>, RemoteError>;
}

/// An authenticated connection to one host.
pub trait RemoteSession {
    fn host(&self) -> &str;

    /// Run `command` to completion, capturing stdout and stderr separately.
    fn exec(&mut self, command: &str, timeout: Option<Duration>)
    -> Result<CommandOutput, RemoteError>;

    /// Start `command` on a PTY-backed channel.
    fn exec_pty(&mut self, command: &str) -> Result<Box<dyn PtyStream>, RemoteError>;

    /// Disconnect. Safe to call more than once.
    fn close(&mut self);
}

/// Opens sessions to named hosts.
pub trait Connector {
    /// Authenticate with `password` when given, otherwise with the application key.
    fn connect(
        &self,
        host: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Owns a session for one unit of work and closes it on every exit path.
pub struct SessionGuard {
    session: Box<dyn RemoteSession>,
}

impl SessionGuard {
    pub fn new(session: Box<dyn RemoteSession>) -> Self {
        Self { session }
    }

    pub fn session(&mut self) -> &mut dyn RemoteSession {
        self.session.as_mut()
    }

    /// Close now instead of at end of scope.
    pub fn close(self) {}
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// Sleep between polls while a command's output is drained.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Move whatever `reader` has buffered into `out`. `Ok(false)` when nothing was
/// available.
fn read_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    out: &mut Vec<u8>,
) -> std::io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read stdout and stderr of a non-blocking channel side by side until the
/// remote end closes both, so neither stream can fill the shared window while
/// the other is waited on.
fn drain_channel(
    channel: &mut ssh2::Channel,
    deadline: Option<Instant>,
) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let mut progressed = read_available(channel, &mut buf, &mut stdout)?;
        progressed |= read_available(&mut channel.stderr(), &mut buf, &mut stderr)?;
        if progressed {
            continue;
        }
        if channel.eof() {
            return Ok((stdout, stderr));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no output before deadline",
            ));
        }
        thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

fn timeout_millis(timeout: Option<Duration>) -> u32 {
    timeout
        .map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Try each resolved address in turn; the last error wins when none connects.
fn connect_first(
    addrs: impl IntoIterator<Item = SocketAddr>,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "address unreachable");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no address found")
    }))
}

/// ssh2-backed [`RemoteSession`].
pub struct SshSession {
    host: String,
    session: ssh2::Session,
    closed: bool,
}

impl SshSession {
    fn command_error(
        command: &str,
        timeout: Option<Duration>,
        timed_out: bool,
        message: impl ToString,
    ) -> RemoteError {
        match timeout {
            Some(after) if timed_out => RemoteError::Timeout {
                command: command.to_string(),
                after,
            },
            _ => RemoteError::execution(format!("{}: {}", command, message.to_string())),
        }
    }
}

impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, RemoteError> {
        self.session.set_timeout(timeout_millis(timeout));

        let ssh_err =
            |e: ssh2::Error| Self::command_error(command, timeout, is_ssh_timeout(&e), e);
        let io_err = |e: std::io::Error| {
            Self::command_error(
                command,
                timeout,
                e.kind() == std::io::ErrorKind::TimedOut,
                e,
            )
        };

        let mut channel = self.session.channel_session().map_err(ssh_err)?;
        channel.exec(command).map_err(ssh_err)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        self.session.set_blocking(false);
        let drained = drain_channel(&mut channel, deadline);
        self.session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(io_err)?;

        channel.wait_close().map_err(ssh_err)?;
        let exit_status = channel.exit_status().ok();

        tracing::debug!(host = %self.host, command, ?exit_status, "remote command finished");

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    fn exec_pty(&mut self, command: &str) -> Result<Box<dyn PtyStream>, RemoteError> {
        // Streamed commands run as long as they need to.
        self.session.set_timeout(0);

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| RemoteError::execution(format!("cannot open channel: {e}")))?;
        channel
            .request_pty("xterm", None, None)
            .map_err(|e| RemoteError::execution(format!("cannot allocate pty: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| RemoteError::execution(format!("{command}: {e}")))?;

        tracing::debug!(host = %self.host, command, "streaming remote command");
        Ok(Box::new(SshPty { channel }))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.disconnect(None, "session closed", None) {
            tracing::debug!(host = %self.host, error = %e, "disconnect failed");
        } else {
            tracing::debug!(host = %self.host, "session closed");
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct SshPty {
    channel: ssh2::Channel,
}

impl Read for SshPty {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.channel.read(buf)
    }
}

impl PtyStream for SshPty {
    fn finish(&mut self) -> Result<Option<i32>, RemoteError> {
        self.channel
            .wait_close()
            .map_err(|e| RemoteError::execution(format!("channel close failed: {e}")))?;
        Ok(self.channel.exit_status().ok())
    }
}

/// Opens and authenticates [`SshSession`]s and manages the application key pair.
#[derive(Debug, Clone)]
pub struct SessionManager {
    keys: KeyPaths,
    known_hosts: PathBuf,
    port: u16,
    timeout: Duration,
    keygen_program: String,
}

impl SessionManager {
    pub fn new(keys: KeyPaths, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            keys,
            known_hosts: known_hosts.into(),
            port: 22,
            timeout: Duration::from_secs(4),
            keygen_program: "ssh-keygen".to_string(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Timeout for connecting and for each blocking protocol step of the handshake.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_keygen_program(mut self, program: impl Into<String>) -> Self {
        self.keygen_program = program.into();
        self
    }

    pub fn keys(&self) -> &KeyPaths {
        &self.keys
    }

    /// Open a session to `host` as `user`.
    ///
    /// No retries: the first failure is returned with the underlying diagnostic.
    pub fn open(
        &self,
        host: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<SshSession, RemoteError> {
        let addrs = (host, self.port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::connection(host, format!("cannot resolve: {e}")))?;
        let tcp = connect_first(addrs, self.timeout).map_err(|e| RemoteError::connection(host, e))?;

        let mut session = ssh2::Session::new().map_err(|e| RemoteError::connection(host, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_millis(Some(self.timeout)));
        session
            .handshake()
            .map_err(|e| RemoteError::connection(host, format!("handshake failed: {e}")))?;

        self.verify_host_key(host, &session)?;

        let auth = match password {
            Some(password) => session.userauth_password(user, password),
            None => {
                if !self.keys.private_key.exists() {
                    return Err(RemoteError::connection(
                        host,
                        format!(
                            "private key {} not found; add the host with a password first",
                            self.keys.private_key.display()
                        ),
                    ));
                }
                session.userauth_pubkey_file(user, None, &self.keys.private_key, None)
            }
        };
        auth.map_err(|e| RemoteError::connection(host, format!("authentication failed: {e}")))?;
        if !session.authenticated() {
            return Err(RemoteError::connection(host, "authentication failed"));
        }

        tracing::debug!(
            host,
            user,
            method = if password.is_some() { "password" } else { "publickey" },
            "session authenticated"
        );

        Ok(SshSession {
            host: host.to_string(),
            session,
            closed: false,
        })
    }

    /// Trust on first use: unknown keys are recorded and accepted, a key that
    /// differs from the recorded one is refused.
    fn verify_host_key(&self, host: &str, session: &ssh2::Session) -> Result<(), RemoteError> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| RemoteError::connection(host, "server sent no host key"))?;

        let mut known = session
            .known_hosts()
            .map_err(|e| RemoteError::connection(host, e))?;
        if self.known_hosts.exists() {
            known
                .read_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                .map_err(|e| {
                    RemoteError::connection(
                        host,
                        format!("cannot read {}: {e}", self.known_hosts.display()),
                    )
                })?;
        }

        match known.check_port(host, self.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => {
                let entry = if self.port == 22 {
                    host.to_string()
                } else {
                    format!("[{}]:{}", host, self.port)
                };
                known
                    .add(&entry, key, "", key_type.into())
                    .map_err(|e| RemoteError::connection(host, e))?;
                if let Some(parent) = self.known_hosts.parent() {
                    fs::create_dir_all(parent).map_err(|e| RemoteError::connection(host, e))?;
                }
                known
                    .write_file(&self.known_hosts, KnownHostFileKind::OpenSSH)
                    .map_err(|e| RemoteError::connection(host, e))?;
                tracing::info!(host, "recorded new host key");
                Ok(())
            }
            CheckResult::Mismatch => Err(RemoteError::connection(
                host,
                format!(
                    "host key does not match the one recorded in {}",
                    self.known_hosts.display()
                ),
            )),
            CheckResult::Failure => Err(RemoteError::connection(host, "host key check failed")),
        }
    }

    /// Make sure the application key pair exists, generating an unencrypted RSA
    /// pair when the private key is missing.
    pub fn provision_key_pair(&self) -> Result<(PathBuf, PathBuf), RemoteError> {
        let KeyPaths {
            private_key,
            public_key,
        } = &self.keys;

        if private_key.exists() {
            tracing::debug!(path = %private_key.display(), "key pair already present");
            return Ok((private_key.clone(), public_key.clone()));
        }

        if let Some(parent) = private_key.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                RemoteError::Keygen(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let output = Command::new(&self.keygen_program)
            .args(["-t", "rsa", "-b", "4096", "-m", "PEM", "-N", "", "-q", "-f"])
            .arg(private_key)
            .output()
            .map_err(|e| {
                RemoteError::Keygen(format!("failed to run {}: {e}", self.keygen_program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostic = match (stderr.trim(), stdout.trim()) {
                ("", "") => format!("{} exited with {}", self.keygen_program, output.status),
                ("", out) => out.to_string(),
                (err, _) => err.to_string(),
            };
            return Err(RemoteError::Keygen(diagnostic));
        }

        tracing::info!(path = %private_key.display(), "generated key pair");
        Ok((private_key.clone(), public_key.clone()))
    }
}

impl Connector for SessionManager {
    fn connect(
        &self,
        host: &str,
        user: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(Box::new(self.open(host, user, password)?))
    }
}

/// Read a public key file, trimmed.
pub fn read_public_key(path: &Path) -> Result<String, RemoteError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| RemoteError::Keygen(format!("cannot read {}: {e}", path.display())))
}

/// Append `public_key` to the remote `authorized_keys` and fix permissions.
///
/// Never fails outright: any remote error is reported to `console` and yields
/// `false`.
pub fn deploy_public_key(
    session: &mut dyn RemoteSession,
    public_key: &str,
    timeout: Option<Duration>,
    console: &dyn Console,
) -> bool {
    let host = session.host().to_string();
    for command in commands::deploy_public_key(public_key) {
        let failure = match session.exec(&command, timeout) {
            Ok(out) if out.success() => continue,
            Ok(out) => format!(
                "`{}` exited with {}: {}",
                command,
                out.exit_status.unwrap_or(-1),
                out.stderr.trim()
            ),
            Err(e) => e.to_string(),
        };
        tracing::warn!(host = %host, error = %failure, "public key deployment failed");
        console.err(&format!("{}: CANNOT DEPLOY KEY!", host));
        console.err(&failure);
        return false;
    }
    tracing::info!(host = %host, "public key deployed");
    true
}
