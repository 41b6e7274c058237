//! Check definitions and the three-dialect verification block parser.
//!
//! A plan's verification block is one of:
//!
//! 1. **Structured**: a JSON array of `{name, cmd, timeout}` /
//!    `{name, manual: true}` objects, for deterministic CI-style gating.
//! 2. **Checklist**: checkbox bullets (`- [ ] ...`); a leading backtick-quoted
//!    token becomes the command, everything else is a manual check.
//! 3. **Free-form bullets**: every bullet is a manual check. Backticks here
//!    are documentation, not an execution instruction, because free-form items
//!    describe outcomes to judge rather than commands to run.
//!
//! Dialects are detected in that priority order. An absent or empty block is
//! the empty-format case: no checks, vacuously satisfied downstream.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

/// How a check is resolved: by running a command or by human/agent judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Cmd,
    Manual,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Cmd => f.write_str("cmd"),
            CheckKind::Manual => f.write_str("manual"),
        }
    }
}

/// One named check parsed from a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDef {
    /// Unique within the plan. Synthesized (`check_NNN`) for dialects 2 and 3.
    pub name: String,
    pub kind: CheckDefKind,
    /// Source bullet text, kept so synthesized names stay human-readable.
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDefKind {
    Cmd {
        cmd: String,
        /// Per-check override of the default execution timeout.
        timeout: Option<Duration>,
    },
    Manual,
}

impl CheckDef {
    pub fn is_manual(&self) -> bool {
        matches!(self.kind, CheckDefKind::Manual)
    }

    pub fn kind_tag(&self) -> CheckKind {
        match self.kind {
            CheckDefKind::Cmd { .. } => CheckKind::Cmd,
            CheckDefKind::Manual => CheckKind::Manual,
        }
    }
}

/// Parse failure for a verification block. Parsing is all-or-nothing: any
/// error yields zero checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckParseError {
    #[error("malformed structured check list: {0}")]
    Malformed(String),

    #[error("check #{index} is missing a name")]
    MissingName { index: usize },

    #[error("duplicate check name '{name}'")]
    DuplicateName { name: String },

    #[error("check '{name}' declares both cmd and manual (they are mutually exclusive)")]
    CmdAndManual { name: String },

    #[error("check '{name}' declares neither cmd nor manual")]
    MissingCmdOrManual { name: String },

    #[error("check '{name}' has a non-positive timeout")]
    BadTimeout { name: String },

    #[error("check '{name}' has a timeout but no cmd")]
    TimeoutWithoutCmd { name: String },
}

#[derive(Debug, Deserialize)]
struct RawCheck {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    manual: bool,
    #[serde(default)]
    timeout: Option<f64>,
}

/// Parse a verification block into canonical check definitions.
pub fn parse_checks(block: &str) -> Result<Vec<CheckDef>, CheckParseError> {
    let trimmed = block.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return parse_structured(trimmed);
    }

    let checkbox = checkbox_re();
    if checkbox.is_match(trimmed) {
        return parse_checklist(trimmed, &checkbox);
    }
    Ok(parse_free_form(trimmed))
}

fn parse_structured(text: &str) -> Result<Vec<CheckDef>, CheckParseError> {
    let raw: Vec<RawCheck> =
        serde_json::from_str(text).map_err(|err| CheckParseError::Malformed(err.to_string()))?;

    let mut defs = Vec::with_capacity(raw.len());
    let mut names = HashSet::new();
    for (index, item) in raw.into_iter().enumerate() {
        let name = match item.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(CheckParseError::MissingName { index }),
        };
        if !names.insert(name.clone()) {
            return Err(CheckParseError::DuplicateName { name });
        }

        let kind = match (item.cmd, item.manual) {
            (Some(_), true) => return Err(CheckParseError::CmdAndManual { name }),
            (None, false) => return Err(CheckParseError::MissingCmdOrManual { name }),
            (None, true) => {
                if item.timeout.is_some() {
                    return Err(CheckParseError::TimeoutWithoutCmd { name });
                }
                CheckDefKind::Manual
            }
            (Some(cmd), false) => {
                let timeout = match item.timeout {
                    Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
                    Some(_) => return Err(CheckParseError::BadTimeout { name }),
                    None => None,
                };
                CheckDefKind::Cmd { cmd, timeout }
            }
        };

        defs.push(CheckDef {
            name,
            kind,
            label: None,
        });
    }
    Ok(defs)
}

fn parse_checklist(text: &str, checkbox: &Regex) -> Result<Vec<CheckDef>, CheckParseError> {
    let backtick = Regex::new(r"^`([^`]+)`").expect("static regex");

    let mut defs = Vec::new();
    for caps in checkbox.captures_iter(text) {
        let item = caps[2].trim().to_string();
        let name = synthesized_name(defs.len());
        let kind = match backtick.captures(&item) {
            Some(cmd_caps) => CheckDefKind::Cmd {
                cmd: cmd_caps[1].to_string(),
                timeout: None,
            },
            None => CheckDefKind::Manual,
        };
        defs.push(CheckDef {
            name,
            kind,
            label: Some(item),
        });
    }
    Ok(defs)
}

fn parse_free_form(text: &str) -> Vec<CheckDef> {
    let bullet = Regex::new(r"(?m)^\s*[-*]\s+(.+)$").expect("static regex");

    let mut defs = Vec::new();
    for caps in bullet.captures_iter(text) {
        let item = caps[1].trim().to_string();
        defs.push(CheckDef {
            name: synthesized_name(defs.len()),
            kind: CheckDefKind::Manual,
            label: Some(item),
        });
    }
    defs
}

fn checkbox_re() -> Regex {
    Regex::new(r"(?m)^\s*[-*]\s*\[([ xX])\]\s*(.+)$").expect("static regex")
}

fn synthesized_name(index: usize) -> String {
    format!("check_{:03}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Structured round-trip: two checks parse to exactly those definitions
    /// in document order.
    #[test]
    fn structured_parses_in_order() {
        let block = r#"[
            {"name": "a", "cmd": "echo 1"},
            {"name": "b", "manual": true}
        ]"#;
        let defs = parse_checks(block).expect("parse");
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "a");
        assert_eq!(
            defs[0].kind,
            CheckDefKind::Cmd {
                cmd: "echo 1".to_string(),
                timeout: None
            }
        );
        assert_eq!(defs[1].name, "b");
        assert!(defs[1].is_manual());
    }

    #[test]
    fn structured_timeout_is_carried() {
        let block = r#"[{"name": "slow", "cmd": "sleep 1", "timeout": 5}]"#;
        let defs = parse_checks(block).expect("parse");
        assert_eq!(
            defs[0].kind,
            CheckDefKind::Cmd {
                cmd: "sleep 1".to_string(),
                timeout: Some(Duration::from_secs(5))
            }
        );
    }

    /// Duplicate names fail the whole document; no partial results.
    #[test]
    fn structured_duplicate_name_fails_all_or_nothing() {
        let block = r#"[
            {"name": "a", "cmd": "echo 1"},
            {"name": "a", "manual": true}
        ]"#;
        let err = parse_checks(block).expect_err("duplicate");
        assert_eq!(
            err,
            CheckParseError::DuplicateName {
                name: "a".to_string()
            }
        );
    }

    #[test]
    fn structured_malformed_document_fails_entirely() {
        let err = parse_checks("[{\"name\": \"a\"").expect_err("malformed");
        assert!(matches!(err, CheckParseError::Malformed(_)));
    }

    #[test]
    fn structured_rejects_cmd_and_manual_together() {
        let block = r#"[{"name": "x", "cmd": "true", "manual": true}]"#;
        let err = parse_checks(block).expect_err("exclusive");
        assert!(matches!(err, CheckParseError::CmdAndManual { .. }));
    }

    #[test]
    fn structured_rejects_non_positive_timeout() {
        let block = r#"[{"name": "x", "cmd": "true", "timeout": 0}]"#;
        let err = parse_checks(block).expect_err("timeout");
        assert!(matches!(err, CheckParseError::BadTimeout { .. }));
    }

    #[test]
    fn structured_rejects_missing_name() {
        let block = r#"[{"cmd": "true"}]"#;
        let err = parse_checks(block).expect_err("name");
        assert_eq!(err, CheckParseError::MissingName { index: 0 });
    }

    /// Checklist items with a leading backtick token become commands; the
    /// rest are manual. Names are synthesized in document order.
    #[test]
    fn checklist_splits_cmd_and_manual() {
        let block = "\
- [ ] `cargo test` runs clean
- [x] docs reviewed by a human
";
        let defs = parse_checks(block).expect("parse");
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "check_001");
        assert_eq!(
            defs[0].kind,
            CheckDefKind::Cmd {
                cmd: "cargo test".to_string(),
                timeout: None
            }
        );
        assert_eq!(defs[1].name, "check_002");
        assert!(defs[1].is_manual());
        assert_eq!(defs[1].label.as_deref(), Some("docs reviewed by a human"));
    }

    /// Free-form bullets are always manual, even when they contain backticks:
    /// they describe outcomes to judge, not commands to run.
    #[test]
    fn free_form_bullets_are_manual_despite_backticks() {
        let block = "\
- the `users` table has the new column
- error pages render without a stack trace
";
        let defs = parse_checks(block).expect("parse");
        assert_eq!(defs.len(), 2);
        assert!(defs.iter().all(CheckDef::is_manual));
        assert_eq!(defs[0].name, "check_001");
        assert_eq!(
            defs[0].label.as_deref(),
            Some("the `users` table has the new column")
        );
    }

    #[test]
    fn empty_block_means_no_checks() {
        assert_eq!(parse_checks("").expect("parse"), Vec::new());
        assert_eq!(parse_checks("  \n\n").expect("parse"), Vec::new());
    }

    #[test]
    fn prose_without_bullets_means_no_checks() {
        let defs = parse_checks("Verify manually before shipping.").expect("parse");
        assert!(defs.is_empty());
    }
}
