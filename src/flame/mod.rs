//! Flame-side conventions: the project database format and the remote command
//! templates used to list, estimate, format and archive projects.

pub mod commands;
pub mod project_db;

pub use project_db::{ProjectDb, ProjectRecord, parse as parse_project_db};

/// Job name for a project: the first `_`-delimited token (`SHOW01_edit` -> `SHOW01`).
pub fn job_name(project: &str) -> &str {
    project.split('_').next().unwrap_or(project)
}

/// Strip the workspace suffix from an `ls` entry, if it carries one.
pub fn workspace_from_entry(entry: &str) -> Option<&str> {
    let name = entry.trim().strip_suffix(commands::WORKSPACE_SUFFIX)?.trim();
    (!name.is_empty()).then_some(name)
}
