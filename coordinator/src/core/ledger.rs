//! Append-only verification events and the status derivation fold.
//!
//! Events are facts; status is a projection. `derive` recomputes every check's
//! status from the event sequence and the *current* check-definition list, so
//! editing a plan's checks orphans or re-introduces checks without migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::checks::{CheckDef, CheckKind};

/// Current status of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// No event mentions the check yet.
    Pending,
    Pass,
    Fail,
    /// The check never got to say anything (timeout, launch failure).
    Error,
}

/// One entry in a run's verification ledger. Append-only; the full sequence
/// is the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationEvent {
    RunStarted {
        at: DateTime<Utc>,
        checks_planned: Vec<String>,
    },
    CheckExecuted {
        at: DateTime<Utc>,
        name: String,
        status: CheckStatus,
        exit_code: Option<i32>,
        output_tail: String,
        #[serde(default)]
        truncated: bool,
    },
    ManualRecorded {
        at: DateTime<Utc>,
        name: String,
        status: CheckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        by: String,
    },
}

impl VerificationEvent {
    /// Name of the check this event settles, if any.
    fn check_name(&self) -> Option<(&str, CheckStatus)> {
        match self {
            VerificationEvent::RunStarted { .. } => None,
            VerificationEvent::CheckExecuted { name, status, .. }
            | VerificationEvent::ManualRecorded { name, status, .. } => {
                Some((name.as_str(), *status))
            }
        }
    }
}

/// Current status of one named check, computed by folding events. Never
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedCheck {
    pub name: String,
    pub kind: CheckKind,
    pub status: CheckStatus,
}

/// Aggregate verification status across all checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Pending,
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Derived {
    pub checks: Vec<DerivedCheck>,
    /// True iff any manual check is not yet pass/fail.
    pub manual_pending: bool,
    pub overall: OverallStatus,
}

impl Derived {
    /// Names of manual checks still awaiting a recorded result.
    pub fn pending_manual_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| {
                check.kind == CheckKind::Manual
                    && !matches!(check.status, CheckStatus::Pass | CheckStatus::Fail)
            })
            .map(|check| check.name.clone())
            .collect()
    }

    /// Names of automatable checks that were never executed.
    pub fn pending_cmd_names(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|check| check.kind == CheckKind::Cmd && check.status == CheckStatus::Pending)
            .map(|check| check.name.clone())
            .collect()
    }
}

/// Fold `events` against the current check list.
///
/// For each defined check the status is the status of its last relevant event
/// (last-write-wins by position), or `pending` when no event mentions it.
/// With no checks at all the overall status is vacuously `pass`.
pub fn derive(events: &[VerificationEvent], defs: &[CheckDef]) -> Derived {
    let checks: Vec<DerivedCheck> = defs
        .iter()
        .map(|def| {
            let status = events
                .iter()
                .filter_map(VerificationEvent::check_name)
                .filter(|(name, _)| *name == def.name)
                .map(|(_, status)| status)
                .next_back()
                .unwrap_or(CheckStatus::Pending);
            DerivedCheck {
                name: def.name.clone(),
                kind: def.kind_tag(),
                status,
            }
        })
        .collect();

    let manual_pending = checks.iter().any(|check| {
        check.kind == CheckKind::Manual
            && !matches!(check.status, CheckStatus::Pass | CheckStatus::Fail)
    });

    let any_bad = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Error));
    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall = if any_bad {
        OverallStatus::Fail
    } else if all_pass {
        OverallStatus::Pass
    } else {
        OverallStatus::Pending
    };

    Derived {
        checks,
        manual_pending,
        overall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checks::CheckDefKind;

    fn cmd_def(name: &str) -> CheckDef {
        CheckDef {
            name: name.to_string(),
            kind: CheckDefKind::Cmd {
                cmd: "true".to_string(),
                timeout: None,
            },
            label: None,
        }
    }

    fn manual_def(name: &str) -> CheckDef {
        CheckDef {
            name: name.to_string(),
            kind: CheckDefKind::Manual,
            label: None,
        }
    }

    fn executed(name: &str, status: CheckStatus) -> VerificationEvent {
        VerificationEvent::CheckExecuted {
            at: Utc::now(),
            name: name.to_string(),
            status,
            exit_code: Some(0),
            output_tail: String::new(),
            truncated: false,
        }
    }

    /// Deriving twice from the same inputs yields identical results.
    #[test]
    fn derivation_is_idempotent() {
        let defs = vec![cmd_def("a"), manual_def("b")];
        let events = vec![executed("a", CheckStatus::Pass)];
        let first = derive(&events, &defs);
        let second = derive(&events, &defs);
        assert_eq!(first, second);
    }

    /// A later duplicate event wins by position, not by value.
    #[test]
    fn last_event_wins_by_position() {
        let defs = vec![cmd_def("a")];
        let events = vec![
            executed("a", CheckStatus::Fail),
            executed("a", CheckStatus::Pass),
        ];
        let derived = derive(&events, &defs);
        assert_eq!(derived.checks[0].status, CheckStatus::Pass);
        assert_eq!(derived.overall, OverallStatus::Pass);

        let reversed = vec![
            executed("a", CheckStatus::Pass),
            executed("a", CheckStatus::Fail),
        ];
        assert_eq!(derive(&reversed, &defs).overall, OverallStatus::Fail);
    }

    #[test]
    fn unmentioned_checks_are_pending() {
        let defs = vec![cmd_def("a"), cmd_def("b")];
        let events = vec![executed("a", CheckStatus::Pass)];
        let derived = derive(&events, &defs);
        assert_eq!(derived.checks[1].status, CheckStatus::Pending);
        assert_eq!(derived.overall, OverallStatus::Pending);
        assert_eq!(derived.pending_cmd_names(), vec!["b".to_string()]);
    }

    /// Events for checks no longer in the plan are ignored; new plan checks
    /// start pending. No migration step needed when a plan changes.
    #[test]
    fn plan_edits_orphan_and_introduce_checks() {
        let events = vec![executed("removed", CheckStatus::Pass)];
        let defs = vec![cmd_def("added")];
        let derived = derive(&events, &defs);
        assert_eq!(derived.checks.len(), 1);
        assert_eq!(derived.checks[0].name, "added");
        assert_eq!(derived.checks[0].status, CheckStatus::Pending);
    }

    #[test]
    fn manual_pending_until_recorded() {
        let defs = vec![manual_def("m")];
        let derived = derive(&[], &defs);
        assert!(derived.manual_pending);
        assert_eq!(derived.pending_manual_names(), vec!["m".to_string()]);

        let events = vec![VerificationEvent::ManualRecorded {
            at: Utc::now(),
            name: "m".to_string(),
            status: CheckStatus::Pass,
            reason: None,
            by: "agent-a".to_string(),
        }];
        let derived = derive(&events, &defs);
        assert!(!derived.manual_pending);
        assert_eq!(derived.overall, OverallStatus::Pass);
    }

    /// Error is distinguishable from fail but both poison the aggregate.
    #[test]
    fn error_status_fails_overall() {
        let defs = vec![cmd_def("a")];
        let events = vec![executed("a", CheckStatus::Error)];
        let derived = derive(&events, &defs);
        assert_eq!(derived.checks[0].status, CheckStatus::Error);
        assert_eq!(derived.overall, OverallStatus::Fail);
    }

    #[test]
    fn no_checks_is_vacuously_pass() {
        let derived = derive(&[], &[]);
        assert_eq!(derived.overall, OverallStatus::Pass);
        assert!(!derived.manual_pending);
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = executed("a", CheckStatus::Pass);
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "check_executed");
        let back: VerificationEvent = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }
}
