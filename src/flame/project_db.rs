//! Parser for the Flame project database (`project.db`).
//!
//! The database is a loosely structured text file. The only lines we care about
//! look like:
//!
//! ```text
//! Project:SHOW01_edit={Description="",HardPtn="stonefs5",Version="8977",,ProcessMode="GPU"}
//! ```
//!
//! Everything else in the file is ignored. Values are kept as raw strings; callers
//! convert them if they need numbers.
//!
//! # Example
//!
//! ```rust
//! use flame_archivist::flame::project_db;
//!
//! let db = project_db::parse("Project:Foo={Version=\"123\"}\n");
//! let projects: Vec<_> = db.into_iter().collect();
//! assert_eq!(projects[0].name, "Foo");
//! assert_eq!(projects[0].get("Version"), Some("123"));
//! ```

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Field that always carries the project name taken from the `Project:<name>` prefix.
pub const NAME_FIELD: &str = "Name";

/// Field holding the storage partition the project's clip library lives on.
pub const PARTITION_FIELD: &str = "HardPtn";

static PROJECT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Project:(\w+)=\{(.+)\}").expect("project line regex"));

/// One `Project:` entry from the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Project identifier, verbatim from the line prefix.
    pub name: String,
    /// Raw `key -> value` pairs from the braces, plus `Name`.
    pub fields: BTreeMap<String, String>,
}

impl ProjectRecord {
    /// Look up a raw field value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Partition (`HardPtn`) holding the project's clip library, if recorded.
    pub fn partition(&self) -> Option<&str> {
        self.get(PARTITION_FIELD).filter(|p| !p.is_empty())
    }
}

/// A parsed view over database text.
///
/// Parsing is lazy and the view is `Copy`, so it can be iterated any number of
/// times; each pass yields the records again in input order.
#[derive(Debug, Clone, Copy)]
pub struct ProjectDb<'a> {
    text: &'a str,
}

/// Parse database text into a restartable sequence of [`ProjectRecord`]s.
pub fn parse(text: &str) -> ProjectDb<'_> {
    ProjectDb { text }
}

impl<'a> ProjectDb<'a> {
    /// Iterate the records.
    pub fn iter(&self) -> Records<'a> {
        Records {
            lines: self.text.lines(),
        }
    }

    /// Project names in input order.
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|p| p.name).collect()
    }
}

impl<'a> IntoIterator for ProjectDb<'a> {
    type Item = ProjectRecord;
    type IntoIter = Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the records of a [`ProjectDb`].
#[derive(Debug, Clone)]
pub struct Records<'a> {
    lines: std::str::Lines<'a>,
}

impl Iterator for Records<'_> {
    type Item = ProjectRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.by_ref().find_map(parse_line)
    }
}

/// Parse a single line; `None` when the line is not a project entry.
fn parse_line(line: &str) -> Option<ProjectRecord> {
    let caps = PROJECT_LINE_RE.captures(line)?;
    let name = caps.get(1)?.as_str().to_string();
    let body = caps.get(2)?.as_str();

    let mut fields = BTreeMap::new();
    for segment in body.split(',') {
        // Doubled commas and bare words carry no pair.
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        fields.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    // The prefix name wins over any `Name=` inside the braces.
    fields.insert(NAME_FIELD.to_string(), name.clone());

    Some(ProjectRecord { name, fields })
}
