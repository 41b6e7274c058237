//! Append-only audit log mirroring transitions and verification events.
//!
//! This is a side-channel for forensics, not a correctness dependency: a
//! failed append degrades to a tracing warning and never fails the operation
//! that produced the entry.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub run_id: String,
    pub action: String,
    pub detail: serde_json::Value,
    /// Forced escapes must be structurally distinguishable from validated
    /// operations, never just prose.
    pub forced: bool,
}

impl AuditEntry {
    pub fn new(
        at: DateTime<Utc>,
        run_id: impl Into<String>,
        action: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            at,
            run_id: run_id.into(),
            action: action.into(),
            detail,
            forced: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// JSON-lines audit log at `<root>/audit.jsonl`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("audit.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Failures are warned about, not returned.
    pub fn record(&self, entry: &AuditEntry) {
        if let Err(err) = self.try_record(entry) {
            warn!(err = %err, path = %self.path.display(), "failed to append audit entry");
        }
    }

    fn try_record(&self, entry: &AuditEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_as_json_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let audit = AuditLog::new(temp.path());

        audit.record(&AuditEntry::new(
            Utc::now(),
            "run-1",
            "transition",
            serde_json::json!({"from": "proposed", "to": "approved"}),
        ));
        audit.record(
            &AuditEntry::new(Utc::now(), "run-1", "transition", serde_json::json!({})).forced(),
        );

        let contents = std::fs::read_to_string(audit.path()).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first["action"], "transition");
        assert_eq!(first["forced"], false);
        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("parse");
        assert_eq!(second["forced"], true);
    }

    /// An unwritable sink degrades to a warning; the call still returns.
    #[test]
    fn unwritable_sink_does_not_panic() {
        let audit = AuditLog::new("/nonexistent-root/deeply/nested");
        audit.record(&AuditEntry::new(
            Utc::now(),
            "run-1",
            "claim",
            serde_json::json!({}),
        ));
    }
}
