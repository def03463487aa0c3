//! Registering a new host.
//!
//! A host is only saved once it has proven usable: a password login works, the
//! archive base path exists, and the application public key is installed so
//! later sessions can log in without a password.

use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, HostConfig, HostSet};
use crate::console::Console;
use crate::remote::{
    Connector, PathKind, RemoteError, RemoteFsProbe, SessionGuard, deploy_public_key,
};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("base path {path} not found on {host}")]
    BasePathMissing { host: String, path: String },

    #[error("could not install the public key on {0}")]
    KeyDeploy(String),
}

/// Verifies a host with a password login and installs the application key.
pub struct HostSetup<'a> {
    connector: &'a dyn Connector,
    console: &'a dyn Console,
    timeout: Option<Duration>,
}

impl<'a> HostSetup<'a> {
    pub fn new(connector: &'a dyn Connector, console: &'a dyn Console) -> Self {
        Self {
            connector,
            console,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Verify `host`, install `public_key` on it, then add it to `hosts`.
    ///
    /// `hosts` is untouched on any failure. The caller persists it.
    pub fn register(
        &self,
        hosts: &mut HostSet,
        host: HostConfig,
        password: &str,
        public_key: &str,
    ) -> Result<(), SetupError> {
        if hosts.get(&host.name).is_some() {
            return Err(ConfigError::DuplicateHost(host.name).into());
        }

        self.console.host_header(&host.name);
        let session = self
            .connector
            .connect(&host.name, &host.user, Some(password))
            .inspect_err(|e| {
                self.console.err(&format!("{}: CANNOT CONNECT!", host.name));
                self.console.err(&e.to_string());
            })?;
        let mut guard = SessionGuard::new(session);

        let probe = RemoteFsProbe::new(self.console, self.timeout);
        if !probe.exists(
            guard.session(),
            &host.base_path,
            PathKind::Dir,
            &format!("Base Path not found: {}", host.base_path),
        ) {
            return Err(SetupError::BasePathMissing {
                host: host.name,
                path: host.base_path,
            });
        }

        if !deploy_public_key(guard.session(), public_key, self.timeout, self.console) {
            return Err(SetupError::KeyDeploy(host.name));
        }
        guard.close();

        tracing::info!(host = %host.name, user = %host.user, base_path = %host.base_path, "host registered");
        self.console.ok(&format!("{}: host added", host.name));
        hosts.add(host)?;
        Ok(())
    }
}
