//! The load generator's status artifact.
//!
//! The artifact is an append-only INI-style text document. Progress
//! markers appear as keys, either as section headers (`[Current rps=42.1]`)
//! or as bare lines (`Current rps=42.1`); the terminal marker is the key
//! `Test finished`. Entries are kept in document order because only the
//! last `Current rps` entry is authoritative.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Key whose presence marks the end of a test.
pub const FINISHED_KEY: &str = "Test finished";

/// Prefix of the throughput keys.
pub const CURRENT_RPS_PREFIX: &str = "Current rps";

static TEST_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"test\.([0-9]+)\.log").expect("static regex"));

/// Numeric id the load generator assigns to a test run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestId(String);

impl TestId {
    /// Extract the id from a test-start response body.
    pub fn from_response(body: &str) -> Option<TestId> {
        TEST_ID_PATTERN
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| TestId(m.as_str().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the log resource, `test.<id>.log`.
    pub fn log_name(&self) -> String {
        format!("test.{}.log", self.0)
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ArtifactError {
    #[error("unparsable throughput in entry {entry:?}")]
    Throughput { entry: String },
}

/// One key in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Enclosing section, `None` before the first header.
    pub section: Option<String>,
    pub key: String,
    pub value: Option<String>,
    /// True when the key came from a `[header]` line.
    pub header: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusArtifact {
    entries: Vec<Entry>,
}

impl StatusArtifact {
    /// Parse leniently. Comments (`;`, `#`) and blank lines are skipped;
    /// anything else becomes an entry.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        let mut section: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                section = Some(name.clone());
                entries.push(Entry {
                    section: None,
                    key: name,
                    value: None,
                    header: true,
                });
                continue;
            }

            let (key, value) = match line.split_once('=').or_else(|| line.split_once(':')) {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (line.to_string(), None),
            };
            entries.push(Entry {
                section: section.clone(),
                key,
                value,
                header: false,
            });
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Presence check on keys (section headers or bare keys).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    pub fn is_finished(&self) -> bool {
        self.contains_key(FINISHED_KEY)
    }

    /// Throughput from the last `Current rps` entry, or `None` if the test
    /// has not reported any yet.
    pub fn current_rps(&self) -> Result<Option<f64>, ArtifactError> {
        let Some(entry) = self
            .entries
            .iter()
            .rev()
            .find(|e| e.key.starts_with(CURRENT_RPS_PREFIX))
        else {
            return Ok(None);
        };

        // `[Current rps=42.1]` keeps the value inside the key.
        let raw = match entry.key.split_once('=') {
            Some((_, v)) => Some(v),
            None => entry.value.as_deref(),
        };

        raw.and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| ArtifactError::Throughput {
                entry: entry.key.clone(),
            })
    }

    /// Value of `key` inside `[section]`, matched case-insensitively.
    pub fn section_value(&self, section: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|e| !e.header && e.section.as_deref() == Some(section))
            .find(|e| e.key.eq_ignore_ascii_case(key))
            .and_then(|e| e.value.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_bare_rps_line_wins() {
        let doc = StatusArtifact::parse("Current rps=10\nCurrent rps=42\n");
        assert_eq!(doc.current_rps().unwrap(), Some(42.0));
        assert!(!doc.is_finished());
    }

    #[test]
    fn last_rps_header_wins() {
        let text = "\
[Test]
type=autoscaling
starttime=2024-01-30 10:00:00

[Current rps=12.5]
[Current rps=61.25]
";
        let doc = StatusArtifact::parse(text);
        assert_eq!(doc.current_rps().unwrap(), Some(61.25));
        assert_eq!(doc.section_value("Test", "StartTime"), Some("2024-01-30 10:00:00"));
    }

    #[test]
    fn finished_marker_is_presence_only() {
        assert!(StatusArtifact::parse("Current rps=3\nTest finished\n").is_finished());
        assert!(StatusArtifact::parse("[Test finished]\n").is_finished());
        assert!(StatusArtifact::parse("Test finished=yes\n").is_finished());
        assert!(!StatusArtifact::parse("Test running\n").is_finished());
    }

    #[test]
    fn no_rps_yet_is_none() {
        let doc = StatusArtifact::parse("[Test]\ntype=warmup\n");
        assert_eq!(doc.current_rps().unwrap(), None);
    }

    #[test]
    fn garbage_rps_is_an_error() {
        let doc = StatusArtifact::parse("Current rps=fast\n");
        assert_eq!(
            doc.current_rps(),
            Err(ArtifactError::Throughput {
                entry: "Current rps".to_string()
            })
        );
        let doc = StatusArtifact::parse("[Current rps]\n");
        assert!(doc.current_rps().is_err());
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let doc = StatusArtifact::parse("; generated\n\n# note\nCurrent rps=7\n");
        assert_eq!(doc.entries().len(), 1);
        assert_eq!(doc.current_rps().unwrap(), Some(7.0));
    }

    #[test]
    fn empty_body_parses_to_empty_document() {
        let doc = StatusArtifact::parse("");
        assert!(doc.is_empty());
        assert!(!doc.is_finished());
    }

    #[test]
    fn test_id_from_start_response() {
        let body = "Test started, see <a href='/log?name=test.12345.log'>log</a>";
        let id = TestId::from_response(body).unwrap();
        assert_eq!(id.as_str(), "12345");
        assert_eq!(id.log_name(), "test.12345.log");
        assert_eq!(id.to_string(), "12345");
    }

    #[test]
    fn test_id_takes_first_match() {
        let id = TestId::from_response("test.1.log then test.2.log").unwrap();
        assert_eq!(id.as_str(), "1");
    }

    #[test]
    fn malformed_test_id_is_none() {
        assert!(TestId::from_response("no log here").is_none());
        assert!(TestId::from_response("test..log").is_none());
        assert!(TestId::from_response("test.abc.log").is_none());
    }
}
