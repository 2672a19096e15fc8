#![allow(clippy::module_name_repetitions)]
//! Small utilities: shell quoting for log lines, lossy file reads, classpath splitting.

use std::fs;
use std::path::Path;

/// Render argv as a copy-pasteable shell command (for logs and error messages only).
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=./:@+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// File contents with invalid UTF-8 replaced; empty when the file cannot be read.
pub fn read_lossy(path: &Path) -> String {
    fs::read(path)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

/// Split a ':'-separated classpath, dropping empty entries.
pub fn split_classpath(s: &str) -> Vec<String> {
    s.split(':')
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}
