//! Remote execution over SSH.
//!
//! - **session**: the [`RemoteSession`]/[`Connector`] seams, the ssh2 implementation,
//!   key-pair provisioning and public-key deployment
//! - **exec**: single-shot and PTY-streamed command execution
//! - **probe**: remote existence checks and directory creation
//! - **error**: the error taxonomy shared by all of the above
//!
//! Everything here is blocking. One session is open at a time; callers wrap it in
//! a [`SessionGuard`] so it is closed on every exit path.

pub mod error;
pub mod exec;
pub mod probe;
pub mod session;

pub use error::RemoteError;
pub use exec::{LineStream, is_banner_noise, run_once, run_streamed};
pub use probe::{PathKind, RemoteFsProbe};
pub use session::{
    CommandOutput, Connector, PtyStream, RemoteSession, SessionGuard, SessionManager, SshSession,
    deploy_public_key, read_public_key,
};
