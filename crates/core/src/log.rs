//! Job log line format.
//!
//! A job log is a plain text file, one record per line. Lines written from a
//! script's stderr carry [`STDERR_PREFIX`]; lines starting with
//! [`SECTION_PREFIX`] open a new section and carry its title. Everything else
//! is stdout.

use serde::Serialize;

/// Prefix of a line read from stderr.
pub const STDERR_PREFIX: &str = "[[stderr]]";

/// Prefix of a section header line.
pub const SECTION_PREFIX: &str = "[[microci-section]]";

/// Output stream a log line came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One parsed log line.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogLine {
    /// Start of a section.
    Section {
        /// Section title.
        title: String,
    },
    /// Script output.
    Output {
        /// Line number within the current section, starting at 1.
        number: usize,
        /// Stream the line came from.
        stream: Stream,
        /// Line text without prefix.
        text: String,
    },
}

/// Formats a section header line (without trailing newline).
pub fn section_line(title: &str) -> String {
    format!("{SECTION_PREFIX}{title}")
}

/// Formats a stderr line (without trailing newline).
pub fn stderr_line(text: &str) -> String {
    format!("{STDERR_PREFIX}{text}")
}

/// Splits a job log into structured lines.
///
/// Output numbering restarts at 1 after every section header. A trailing
/// line without newline is still returned.
pub fn parse_log(text: &str) -> Vec<LogLine> {
    let mut out = Vec::new();
    let mut number = 0;
    for raw in text.lines() {
        if let Some(title) = raw.strip_prefix(SECTION_PREFIX) {
            number = 0;
            out.push(LogLine::Section {
                title: title.to_string(),
            });
            continue;
        }
        number += 1;
        let (stream, line) = match raw.strip_prefix(STDERR_PREFIX) {
            Some(rest) => (Stream::Stderr, rest),
            None => (Stream::Stdout, raw),
        };
        out.push(LogLine::Output {
            number,
            stream,
            text: line.to_string(),
        });
    }
    out
}
