//! Host list, preferences and on-disk locations.
//!
//! Everything lives under one config directory (platform default from
//! `directories`, or `--config-dir`):
//!
//! ```text
//! <config>/hosts.json        {"render01": {"enabled": true, "user": "artist", "base_path": "/mnt/archive"}}
//! <config>/prefs.json        {"timeout_secs": 4.0, "port": 22, "viewer_path": "..."}
//! <config>/ssh/flame-archivist_<local-hostname>[.pub]
//! <config>/ssh/known_hosts
//! ```
//!
//! [`AppContext`] bundles all of it and is passed explicitly to whoever needs it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application identifier; namespaces the config dir and the key pair.
pub const APP_ID: &str = "flame-archivist";

pub const DEFAULT_TIMEOUT_SECS: f64 = 4.0;

pub const DEFAULT_VIEWER_PATH: &str = "/opt/Autodesk/flame_2021.1/bin/startApplication";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not determine a config directory; pass --config-dir")]
    NoConfigDir,

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("host already configured: {0}")]
    DuplicateHost(String),
}

/// One configured remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Map key in `hosts.json`; filled in on load.
    #[serde(skip)]
    pub name: String,
    pub enabled: bool,
    pub user: String,
    pub base_path: String,
}

impl HostConfig {
    pub fn new(name: impl Into<String>, user: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            user: user.into(),
            base_path: base_path.into(),
        }
    }
}

/// Configured hosts keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostSet {
    hosts: BTreeMap<String, HostConfig>,
}

impl HostSet {
    /// Load from `path`; a missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut set: HostSet =
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        for (name, host) in set.hosts.iter_mut() {
            host.name = name.clone();
        }
        Ok(set)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self)
    }

    pub fn get(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.get(name)
    }

    /// All hosts, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &HostConfig> {
        self.iter().filter(|h| h.enabled)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn add(&mut self, host: HostConfig) -> Result<(), ConfigError> {
        if self.hosts.contains_key(&host.name) {
            return Err(ConfigError::DuplicateHost(host.name));
        }
        self.hosts.insert(host.name.clone(), host);
        Ok(())
    }

    /// Insert or replace by name.
    pub fn upsert(&mut self, host: HostConfig) {
        self.hosts.insert(host.name.clone(), host);
    }

    pub fn remove(&mut self, name: &str) -> Result<HostConfig, ConfigError> {
        self.hosts
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownHost(name.to_string()))
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), ConfigError> {
        let host = self
            .hosts
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownHost(name.to_string()))?;
        host.enabled = enabled;
        Ok(())
    }
}

/// User preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prefs {
    /// Connect and single-shot command timeout.
    pub timeout_secs: f64,
    pub port: u16,
    /// Local viewer launched by `farc launch`.
    pub viewer_path: String,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            port: 22,
            viewer_path: DEFAULT_VIEWER_PATH.to_string(),
        }
    }
}

impl Prefs {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Falls back to the default for non-positive or non-finite values.
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            Duration::from_secs_f64(self.timeout_secs)
        } else {
            Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS)
        }
    }
}

/// The application key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
}

impl KeyPaths {
    /// `<dir>/<app-id>_<local-hostname>` and its `.pub` sibling.
    pub fn in_dir(dir: &Path, local_hostname: &str) -> Self {
        let private_key = dir.join(format!("{}_{}", APP_ID, local_hostname));
        let mut public_key = private_key.clone().into_os_string();
        public_key.push(".pub");
        Self {
            private_key,
            public_key: PathBuf::from(public_key),
        }
    }
}

/// Files under the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub hosts_file: PathBuf,
    pub prefs_file: PathBuf,
    pub ssh_dir: PathBuf,
    pub keys: KeyPaths,
    pub known_hosts: PathBuf,
}

impl AppPaths {
    pub fn new(config_dir: impl Into<PathBuf>, local_hostname: &str) -> Self {
        let config_dir = config_dir.into();
        let ssh_dir = config_dir.join("ssh");
        Self {
            hosts_file: config_dir.join("hosts.json"),
            prefs_file: config_dir.join("prefs.json"),
            keys: KeyPaths::in_dir(&ssh_dir, local_hostname),
            known_hosts: ssh_dir.join("known_hosts"),
            ssh_dir,
            config_dir,
        }
    }

    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("com", APP_ID, APP_ID)
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Paths, preferences and hosts for one invocation.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub paths: AppPaths,
    pub prefs: Prefs,
    pub hosts: HostSet,
}

impl AppContext {
    /// Load from `config_dir`, or the platform default when `None`.
    pub fn load(config_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => AppPaths::default_config_dir()?,
        };
        let paths = AppPaths::new(config_dir, &local_hostname());
        let prefs = Prefs::load(&paths.prefs_file)?;
        let hosts = HostSet::load(&paths.hosts_file)?;
        tracing::debug!(
            config_dir = %paths.config_dir.display(),
            hosts = hosts.len(),
            "configuration loaded"
        );
        Ok(Self {
            paths,
            prefs,
            hosts,
        })
    }

    pub fn save_hosts(&self) -> Result<(), ConfigError> {
        self.hosts.save(&self.paths.hosts_file)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Name of the local machine, used to namespace the key pair.
#[cfg(unix)]
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
        if !name.is_empty() {
            return name;
        }
    }
    hostname_from_env()
}

#[cfg(not(unix))]
pub fn local_hostname() -> String {
    hostname_from_env()
}

fn hostname_from_env() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
