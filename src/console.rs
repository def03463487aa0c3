//! Human-readable progress output.
//!
//! Operations report what they are doing line by line through a [`Console`]. The
//! terminal implementation colors lines by kind; [`MemoryConsole`] records them
//! for tests. Diagnostics for operators go through `tracing`, not here.

use std::sync::Mutex;

use colored::Colorize;

/// Kind of a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Progress and headers.
    Out,
    /// Remote tool output and results.
    Ok,
    /// Failures.
    Err,
}

/// Append-only sink for progress lines.
pub trait Console {
    fn line(&self, level: Level, text: &str);

    fn out(&self, text: &str) {
        self.line(Level::Out, text);
    }

    fn ok(&self, text: &str) {
        self.line(Level::Ok, text);
    }

    fn err(&self, text: &str) {
        self.line(Level::Err, text);
    }

    /// Three-line star banner around `text`.
    fn banner(&self, text: &str) {
        let rule = "*".repeat(text.chars().count() + 8);
        self.out(&rule);
        self.out(&format!("* {}", text));
        self.out(&rule);
    }

    fn host_header(&self, host: &str) {
        self.out(&format!("**************** {} ****************", host));
    }
}

/// Colored terminal output. Errors always go to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConsole {
    all_to_stderr: bool,
}

impl TerminalConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep stdout clean for machine-readable output.
    pub fn stderr_only() -> Self {
        Self {
            all_to_stderr: true,
        }
    }
}

impl Console for TerminalConsole {
    fn line(&self, level: Level, text: &str) {
        match level {
            Level::Err => eprintln!("{}", text.red()),
            Level::Out if self.all_to_stderr => eprintln!("{}", text.cyan()),
            Level::Ok if self.all_to_stderr => eprintln!("{}", text.green()),
            Level::Out => println!("{}", text.cyan()),
            Level::Ok => println!("{}", text.green()),
        }
    }
}

/// Records every line; used by tests.
#[derive(Debug, Default)]
pub struct MemoryConsole {
    entries: Mutex<Vec<(Level, String)>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Level, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Lines of one kind, in order.
    pub fn lines(&self, level: Level) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, text)| text)
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries().iter().any(|(_, text)| text.contains(needle))
    }
}

impl Console for MemoryConsole {
    fn line(&self, level: Level, text: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((level, text.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_width() {
        let console = MemoryConsole::new();
        console.banner("Archiving Complete");
        let lines = console.lines(Level::Out);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "*".repeat(26));
        assert_eq!(lines[1], "* Archiving Complete");
        assert_eq!(lines[2], lines[0]);
    }

    #[test]
    fn test_levels_are_kept_apart() {
        let console = MemoryConsole::new();
        console.host_header("render01");
        console.ok("12.4 GB");
        console.err("render01: CANNOT CONNECT!");

        assert_eq!(
            console.lines(Level::Out),
            vec!["**************** render01 ****************"]
        );
        assert_eq!(console.lines(Level::Ok), vec!["12.4 GB"]);
        assert_eq!(console.lines(Level::Err), vec!["render01: CANNOT CONNECT!"]);
        assert!(console.contains("CANNOT"));
    }
}
