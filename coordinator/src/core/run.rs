//! The run record: immutable history plus one mutable current-state pointer.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ledger::VerificationEvent;
use crate::core::state::RunState;

/// One applied transition. Transitions are facts: the list is append-only and
/// `state` is a projection of the latest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Set when validation was bypassed. The audit trail must show *that* it
    /// was bypassed, not hide it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
}

/// A time-bounded exclusive execution lease on a run.
///
/// Modeled as a single optional struct so "claimed_by is set iff
/// claim_expires is set" holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claimed_by: String,
    pub claimed_at: DateTime<Utc>,
    pub claim_expires: DateTime<Utc>,
}

impl Claim {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.claim_expires <= now
    }
}

/// A structured failure entry recorded by `record_fail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: u32,
    pub description: String,
    pub by: String,
    pub at: DateTime<Utc>,
}

/// Event-sourced verification state for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub events: Vec<VerificationEvent>,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl Verification {
    pub fn next_issue_id(&self) -> u32 {
        self.issues.iter().map(|issue| issue.id).max().unwrap_or(0) + 1
    }
}

/// The unit of trackable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative: Option<String>,
    pub state: RunState,
    /// Reference to the externally-owned plan. The file may no longer exist;
    /// an orphaned run is reportable, not an invariant violation.
    pub plan_path: PathBuf,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    /// File paths this run is expected to modify; the basis for conflict
    /// detection.
    #[serde(default)]
    pub files_touched: BTreeSet<String>,
    /// Advisory ordering hint, not enforced by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Advisory dependency hints, not enforced by the engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Optimistic lock token: file mtime captured at load. "Unchanged" means
    /// unchanged at filesystem mtime granularity, nothing stronger.
    #[serde(skip)]
    pub version: Option<SystemTime>,
}

impl Run {
    /// A fresh run as produced by intake: state `proposed`, no history.
    pub fn new(id: impl Into<String>, plan_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            initiative: None,
            state: RunState::Proposed,
            plan_path: plan_path.into(),
            transitions: Vec::new(),
            verification: None,
            claim: None,
            files_touched: BTreeSet::new(),
            priority: None,
            depends_on: Vec::new(),
            version: None,
        }
    }

    /// Append a transition record and move `state`. Callers are responsible
    /// for validating the edge first (or marking it forced).
    pub fn record_transition(
        &mut self,
        to: RunState,
        at: DateTime<Utc>,
        by: &str,
        reason: Option<&str>,
        forced: bool,
    ) {
        self.transitions.push(Transition {
            from: self.state,
            to,
            at,
            by: by.to_string(),
            reason: reason.map(str::to_string),
            forced,
        });
        self.state = to;
    }

    /// The current claim if it has not expired.
    pub fn active_claim_at(&self, now: DateTime<Utc>) -> Option<&Claim> {
        self.claim.as_ref().filter(|claim| !claim.is_expired_at(now))
    }

    pub fn verification_mut(&mut self) -> &mut Verification {
        self.verification.get_or_insert_with(Verification::default)
    }

    pub fn events(&self) -> &[VerificationEvent] {
        self.verification
            .as_ref()
            .map(|verification| verification.events.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn new_run_starts_proposed_with_empty_history() {
        let run = Run::new("run-1", "plans/run-1.md");
        assert_eq!(run.state, RunState::Proposed);
        assert!(run.transitions.is_empty());
        assert!(run.claim.is_none());
        assert!(run.verification.is_none());
    }

    #[test]
    fn record_transition_appends_and_moves_state() {
        let mut run = Run::new("run-1", "plans/run-1.md");
        let at = Utc::now();
        run.record_transition(RunState::Approved, at, "reviewer", Some("lgtm"), false);

        assert_eq!(run.state, RunState::Approved);
        assert_eq!(run.transitions.len(), 1);
        let transition = &run.transitions[0];
        assert_eq!(transition.from, RunState::Proposed);
        assert_eq!(transition.to, RunState::Approved);
        assert_eq!(transition.by, "reviewer");
        assert!(!transition.forced);
    }

    #[test]
    fn expired_claim_is_not_active() {
        let now = Utc::now();
        let mut run = Run::new("run-1", "plans/run-1.md");
        run.claim = Some(Claim {
            claimed_by: "agent-a".to_string(),
            claimed_at: now - TimeDelta::minutes(40),
            claim_expires: now - TimeDelta::minutes(10),
        });
        assert!(run.active_claim_at(now).is_none());

        run.claim.as_mut().expect("claim").claim_expires = now + TimeDelta::minutes(10);
        assert_eq!(
            run.active_claim_at(now).map(|claim| claim.claimed_by.as_str()),
            Some("agent-a")
        );
    }

    #[test]
    fn issue_ids_auto_increment() {
        let mut verification = Verification::default();
        assert_eq!(verification.next_issue_id(), 1);
        verification.issues.push(Issue {
            id: 1,
            description: "tests fail".to_string(),
            by: "agent-a".to_string(),
            at: Utc::now(),
        });
        assert_eq!(verification.next_issue_id(), 2);
    }

    /// The version token never leaks into the serialized record.
    #[test]
    fn version_token_is_not_persisted() {
        let mut run = Run::new("run-1", "plans/run-1.md");
        run.version = Some(SystemTime::now());
        let json = serde_json::to_value(&run).expect("serialize");
        assert!(json.get("version").is_none());
        let back: Run = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.version, None);
    }
}
