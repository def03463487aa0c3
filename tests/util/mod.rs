//! Simulated Flame hosts for driving the workflow without a network.
//!
//! [`FakeRemote`] implements [`Connector`] over an in-memory model of each host:
//! which directories and files exist, the project database text, the workspace
//! entries of each project, and how the archive tool behaves. Every command a
//! session receives is decoded back into an [`Op`] and logged, so tests can
//! assert the exact remote sequence.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flame_archivist::config::{HostConfig, HostSet};
use flame_archivist::remote::{CommandOutput, Connector, PtyStream, RemoteError, RemoteSession};

/// One decoded remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect { password: bool },
    ProbeDir(String, bool),
    ProbeFile(String, bool),
    Mkdir(String),
    ListDb,
    ListWorkspaces(String),
    Estimate { project: String, workspace: String },
    Format(String),
    Archive { file: String, project: String, workspace: String },
    Other(String),
}

/// State of one simulated host.
#[derive(Debug, Clone)]
pub struct FakeHost {
    pub dirs: BTreeSet<String>,
    pub files: BTreeSet<String>,
    pub project_db: String,
    /// `ls` output keyed by project directory.
    pub workspace_listing: BTreeMap<String, String>,
    pub estimate_output: String,
    pub format_status: i32,
    pub archive_output: String,
    pub archive_status: i32,
    /// When false, `mkdir -p` fails without creating anything.
    pub mkdir_works: bool,
    pub refuse_connections: bool,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            dirs: BTreeSet::new(),
            files: BTreeSet::new(),
            project_db: String::new(),
            workspace_listing: BTreeMap::new(),
            estimate_output: String::new(),
            format_status: 0,
            archive_output: "Connected to localhost\r\nArchiving done\r\n".to_string(),
            archive_status: 0,
            mkdir_works: true,
            refuse_connections: false,
        }
    }
}

impl FakeHost {
    pub fn with_dir(mut self, path: &str) -> Self {
        self.dirs.insert(path.to_string());
        self
    }

    pub fn with_file(mut self, path: &str) -> Self {
        self.files.insert(path.to_string());
        self
    }

    /// Add a project on `partition` with the given workspace names.
    pub fn with_project(mut self, partition: &str, project: &str, workspaces: &[&str]) -> Self {
        self.project_db.push_str(&format!(
            "Project:{project}={{Description=\"\",HardPtn=\"{partition}\",Version=\"2021\"}}\n"
        ));
        let dir = format!("/opt/Autodesk/clip/{partition}/{project}.prj/");
        let listing: String = workspaces.iter().map(|w| format!("{w}.wksp\n")).collect();
        self.workspace_listing.insert(dir, listing);
        self
    }
}

#[derive(Default)]
struct State {
    hosts: BTreeMap<String, FakeHost>,
    ops: Vec<(String, Op)>,
    opened: usize,
    closed: usize,
}

/// Shared handle to the simulated hosts.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, name: &str, host: FakeHost) -> Self {
        self.state
            .lock()
            .unwrap()
            .hosts
            .insert(name.to_string(), host);
        self
    }

    /// Operations on one host, in order.
    pub fn ops(&self, host: &str) -> Vec<Op> {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, op)| op.clone())
            .collect()
    }

    pub fn all_ops(&self) -> Vec<(String, Op)> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn host(&self, name: &str) -> FakeHost {
        self.state.lock().unwrap().hosts[name].clone()
    }

    fn record(&self, host: &str, op: Op) {
        self.state
            .lock()
            .unwrap()
            .ops
            .push((host.to_string(), op));
    }
}

impl Connector for FakeRemote {
    fn connect(
        &self,
        host: &str,
        _user: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let refused = {
            let state = self.state.lock().unwrap();
            state.hosts.get(host).is_none_or(|h| h.refuse_connections)
        };
        self.record(
            host,
            Op::Connect {
                password: password.is_some(),
            },
        );
        if refused {
            return Err(RemoteError::connection(host, "Connection refused"));
        }
        self.state.lock().unwrap().opened += 1;
        Ok(Box::new(FakeSession {
            host: host.to_string(),
            remote: self.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    host: String,
    remote: FakeRemote,
    closed: bool,
}

fn flag_value(tokens: &[String], flag: &str) -> String {
    tokens
        .iter()
        .position(|t| t == flag)
        .and_then(|i| tokens.get(i + 1))
        .cloned()
        .unwrap_or_default()
}

impl FakeSession {
    fn decode(command: &str) -> Op {
        let tokens = shell_words::split(command).unwrap_or_default();
        let first = tokens.first().map(String::as_str).unwrap_or("");
        match first {
            "if" if tokens.get(2).is_some_and(|t| t == "-d") => {
                Op::ProbeDir(tokens[3].clone(), false)
            }
            "if" if tokens.get(2).is_some_and(|t| t == "-f") => {
                Op::ProbeFile(tokens[3].clone(), false)
            }
            "mkdir" => Op::Mkdir(tokens[2].clone()),
            "cat" => Op::ListDb,
            "ls" => Op::ListWorkspaces(tokens[1].clone()),
            _ if tokens.iter().any(|t| t == "--estimate") => Op::Estimate {
                project: flag_value(&tokens, "--project"),
                workspace: flag_value(&tokens, "--entry").trim_start_matches('/').to_string(),
            },
            _ if tokens.iter().any(|t| t == "--format") => {
                Op::Format(flag_value(&tokens, "--file"))
            }
            _ if tokens.iter().any(|t| t == "--archive") => Op::Archive {
                file: flag_value(&tokens, "--file"),
                project: flag_value(&tokens, "--project"),
                workspace: flag_value(&tokens, "--entry").trim_start_matches('/').to_string(),
            },
            _ => Op::Other(command.to_string()),
        }
    }

    fn ok(stdout: impl Into<String>, status: i32) -> CommandOutput {
        CommandOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_status: Some(status),
        }
    }
}

impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn exec(
        &mut self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, RemoteError> {
        let op = Self::decode(command);
        let mut state = self.remote.state.lock().unwrap();
        let host = state.hosts.get_mut(&self.host).unwrap();

        let (logged, output) = match op {
            Op::ProbeDir(path, _) => {
                let found = host.dirs.contains(&path);
                let out = Self::ok(if found { "1\n" } else { "0\n" }, 0);
                (Op::ProbeDir(path, found), out)
            }
            Op::ProbeFile(path, _) => {
                let found = host.files.contains(&path);
                let out = Self::ok(if found { "1\n" } else { "0\n" }, 0);
                (Op::ProbeFile(path, found), out)
            }
            Op::Mkdir(path) => {
                if host.mkdir_works {
                    host.dirs.insert(path.clone());
                    (Op::Mkdir(path), Self::ok("1\n", 0))
                } else {
                    let out = CommandOutput {
                        stdout: String::new(),
                        stderr: "mkdir: Permission denied\n".to_string(),
                        exit_status: Some(1),
                    };
                    (Op::Mkdir(path), out)
                }
            }
            Op::ListDb => (Op::ListDb, Self::ok(host.project_db.clone(), 0)),
            Op::ListWorkspaces(dir) => {
                let listing = host.workspace_listing.get(&dir).cloned().unwrap_or_default();
                let status = if listing.is_empty() { 1 } else { 0 };
                (Op::ListWorkspaces(dir), Self::ok(listing, status))
            }
            op @ Op::Estimate { .. } => (op, Self::ok(host.estimate_output.clone(), 0)),
            Op::Format(file) => {
                if host.format_status == 0 {
                    host.files.insert(file.clone());
                }
                (Op::Format(file), Self::ok("", host.format_status))
            }
            other => {
                drop(state);
                self.remote.record(&self.host, other);
                return Err(RemoteError::execution(format!("unexpected command {command}")));
            }
        };
        state.ops.push((self.host.clone(), logged));
        Ok(output)
    }

    fn exec_pty(&mut self, command: &str) -> Result<Box<dyn PtyStream>, RemoteError> {
        let op = Self::decode(command);
        let (data, status) = {
            let state = self.remote.state.lock().unwrap();
            let host = &state.hosts[&self.host];
            (host.archive_output.clone(), host.archive_status)
        };
        let accepted = matches!(op, Op::Archive { .. });
        self.remote.record(&self.host, op);
        if !accepted {
            return Err(RemoteError::execution(format!("unexpected pty command {command}")));
        }
        Ok(Box::new(FakePty {
            data: Cursor::new(data.into_bytes()),
            status,
        }))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.remote.state.lock().unwrap().closed += 1;
        }
    }
}

struct FakePty {
    data: Cursor<Vec<u8>>,
    status: i32,
}

impl Read for FakePty {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.data.read(buf)
    }
}

impl PtyStream for FakePty {
    fn finish(&mut self) -> Result<Option<i32>, RemoteError> {
        Ok(Some(self.status))
    }
}

/// Host set with one enabled host per `(name, base_path)`, all as user `artist`.
pub fn host_set(hosts: &[(&str, &str)]) -> HostSet {
    let mut set = HostSet::default();
    for (name, base_path) in hosts {
        set.add(HostConfig::new(*name, "artist", *base_path)).unwrap();
    }
    set
}

/// Captures tracing output for tests.
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
