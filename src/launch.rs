//! Opening a workspace in the local Flame viewer.

use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::console::Console;
use crate::workflow::WorkspaceRef;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("viewer not found at {0}")]
    NotFound(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// `<viewer> -H <host> -J <project> -W <workspace>`, unspawned.
pub fn viewer_command(viewer_path: &str, target: &WorkspaceRef) -> Command {
    let mut cmd = Command::new(viewer_path);
    cmd.arg("-H")
        .arg(&target.host)
        .arg("-J")
        .arg(&target.project)
        .arg("-W")
        .arg(&target.workspace);
    cmd
}

/// Start the viewer detached and return its pid without waiting.
pub fn launch_viewer(
    viewer_path: &str,
    target: &WorkspaceRef,
    console: &dyn Console,
) -> Result<u32, LaunchError> {
    if !Path::new(viewer_path).exists() {
        return Err(LaunchError::NotFound(viewer_path.to_string()));
    }

    console.banner("Launching Flame...");
    console.out(&format!(
        "{}: Project = {}, Workspace = {}",
        target.host, target.project, target.workspace
    ));

    let child = viewer_command(viewer_path, target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            program: viewer_path.to_string(),
            source,
        })?;

    tracing::info!(pid = child.id(), viewer = viewer_path, workspace = %target, "viewer started");
    Ok(child.id())
}
