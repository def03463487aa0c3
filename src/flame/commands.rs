//! Remote shell command templates.
//!
//! Paths and binaries follow the stock Flame install layout on the render hosts.
//! Anything interpolated from user data (paths, workspace names) is shell-quoted.

use std::borrow::Cow;

/// Directory holding the Flame IO tools.
pub const IO_BIN_DIR: &str = "/opt/Autodesk/io/bin";

/// The archive tool inside [`IO_BIN_DIR`].
pub const ARCHIVE_TOOL: &str = "flame_archive";

/// Project database read during listing.
pub const PROJECT_DB_PATH: &str = "/opt/Autodesk/project/project.db";

/// Root of the per-partition clip libraries.
pub const CLIP_ROOT: &str = "/opt/Autodesk/clip";

/// Suffix marking workspace entries inside a project's clip directory.
pub const WORKSPACE_SUFFIX: &str = ".wksp";

/// Flags passed to every estimate/archive invocation.
const COMMON_ARCHIVE_FLAGS: &str = "--linked --omit sources,renders";

fn quote(s: &str) -> Cow<'_, str> {
    shell_words::quote(s)
}

fn archive_tool() -> String {
    format!("{}/{}", IO_BIN_DIR, ARCHIVE_TOOL)
}

fn entry_arg(workspace: &str) -> String {
    quote(&format!("/{}", workspace)).into_owned()
}

/// Dump the remote project database.
pub fn list_project_db() -> String {
    format!("cat {}", PROJECT_DB_PATH)
}

/// List workspace entries of a project on its partition.
pub fn list_workspaces(partition: &str, project: &str) -> String {
    let dir = format!("{}/{}/{}.prj/", CLIP_ROOT, partition, project);
    format!("ls {} | grep '\\{}$'", quote(&dir), WORKSPACE_SUFFIX)
}

/// Estimate the archive size of one workspace. Output is the size line(s) only.
pub fn estimate_archive(project: &str, workspace: &str) -> String {
    format!(
        "{} --estimate --project {} --entry {} {} | grep -e MB -e GB",
        archive_tool(),
        quote(project),
        entry_arg(workspace),
        COMMON_ARCHIVE_FLAGS
    )
}

/// Initialise a new archive file.
pub fn format_archive(file: &str) -> String {
    format!("{} --format --file {}", archive_tool(), quote(file))
}

/// Archive one workspace into an existing archive file, verbosely.
pub fn archive(file: &str, project: &str, workspace: &str) -> String {
    format!(
        "{} -v --archive --file {} --project {} --entry {} {}",
        archive_tool(),
        quote(file),
        quote(project),
        entry_arg(workspace),
        COMMON_ARCHIVE_FLAGS
    )
}

/// Prints `1` when `path` is a directory, `0` otherwise.
pub fn dir_exists(path: &str) -> String {
    format!("if [ -d {} ]; then echo 1; else echo 0; fi", quote(path))
}

/// Prints `1` when `path` is a regular file, `0` otherwise.
pub fn file_exists(path: &str) -> String {
    format!("if [ -f {} ]; then echo 1; else echo 0; fi", quote(path))
}

/// Recursive, idempotent directory creation.
pub fn create_dir(path: &str) -> String {
    format!("mkdir -p {} && echo 1", quote(path))
}

/// Commands that install `public_key` into the remote `authorized_keys`,
/// skipping the append when the exact line is already present.
pub fn deploy_public_key(public_key: &str) -> Vec<String> {
    let key = quote(public_key.trim());
    vec![
        "mkdir -p ~/.ssh".to_string(),
        format!(
            "grep -qxF {key} ~/.ssh/authorized_keys 2>/dev/null || echo {key} >> ~/.ssh/authorized_keys"
        ),
        "chmod 644 ~/.ssh/authorized_keys".to_string(),
        "chmod 700 ~/.ssh".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_commands() {
        assert_eq!(
            dir_exists("/mnt/archive"),
            "if [ -d /mnt/archive ]; then echo 1; else echo 0; fi"
        );
        assert_eq!(
            file_exists("/mnt/my archive/x"),
            "if [ -f '/mnt/my archive/x' ]; then echo 1; else echo 0; fi"
        );
        assert_eq!(create_dir("/a/b"), "mkdir -p /a/b && echo 1");
    }

    #[test]
    fn test_archive_commands_carry_common_flags() {
        let cmd = archive("/mnt/a/SHOW01_edit", "SHOW01_edit", "Main WS");
        assert!(cmd.starts_with("/opt/Autodesk/io/bin/flame_archive -v --archive"));
        assert!(cmd.contains("--file /mnt/a/SHOW01_edit"));
        assert!(cmd.contains("--project SHOW01_edit"));
        assert!(cmd.contains("--entry '/Main WS'"));
        assert!(cmd.ends_with("--linked --omit sources,renders"));

        let est = estimate_archive("SHOW01_edit", "ws");
        assert!(est.contains("--estimate"));
        assert!(est.contains("--entry /ws --linked --omit sources,renders"));
        assert!(est.ends_with("| grep -e MB -e GB"));

        assert_eq!(
            format_archive("/mnt/a/p"),
            "/opt/Autodesk/io/bin/flame_archive --format --file /mnt/a/p"
        );
    }

    #[test]
    fn test_listing_commands() {
        assert_eq!(list_project_db(), "cat /opt/Autodesk/project/project.db");
        assert_eq!(
            list_workspaces("stonefs5", "SHOW01_edit"),
            "ls /opt/Autodesk/clip/stonefs5/SHOW01_edit.prj/ | grep '\\.wksp$'"
        );
    }

    #[test]
    fn test_deploy_key_is_quoted_and_idempotent() {
        let cmds = deploy_public_key("ssh-rsa AAAAB3 user@box\n");
        assert_eq!(cmds.len(), 4);
        assert!(cmds[1].starts_with("grep -qxF 'ssh-rsa AAAAB3 user@box'"));
        assert!(cmds[1].contains("|| echo 'ssh-rsa AAAAB3 user@box' >>"));
    }
}
