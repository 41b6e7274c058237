//! Hierarchical run lifecycle states and the transition table.
//!
//! States are written as `parent` or `parent/substate` (e.g. `verifying/failed`).
//! The transition table is the single source of truth for which edges exist;
//! everything else (target resolution, auto-transition paths) is derived from it.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Substates of `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveSub {
    Executing,
    Paused,
    Checkpoint,
}

/// Substates of `verifying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyingSub {
    Testing,
    Passed,
    Failed,
    Fixing,
    Retesting,
}

/// Lifecycle state of a run.
///
/// `active` and `verifying` carry a required substate; the remaining states
/// are flat. Serialized as the `parent/substate` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Proposed,
    Approved,
    Ready,
    Active(ActiveSub),
    Verifying(VerifyingSub),
    Complete,
    Abandoned,
}

/// Every known state, in table order. Used for closure tests and error messages.
pub const ALL_STATES: [RunState; 13] = [
    RunState::Proposed,
    RunState::Approved,
    RunState::Ready,
    RunState::Active(ActiveSub::Executing),
    RunState::Active(ActiveSub::Paused),
    RunState::Active(ActiveSub::Checkpoint),
    RunState::Verifying(VerifyingSub::Testing),
    RunState::Verifying(VerifyingSub::Passed),
    RunState::Verifying(VerifyingSub::Failed),
    RunState::Verifying(VerifyingSub::Fixing),
    RunState::Verifying(VerifyingSub::Retesting),
    RunState::Complete,
    RunState::Abandoned,
];

impl RunState {
    /// Parent component of the state name (`"verifying"` for `verifying/failed`).
    pub fn parent(self) -> &'static str {
        match self {
            RunState::Proposed => "proposed",
            RunState::Approved => "approved",
            RunState::Ready => "ready",
            RunState::Active(_) => "active",
            RunState::Verifying(_) => "verifying",
            RunState::Complete => "complete",
            RunState::Abandoned => "abandoned",
        }
    }

    fn substate(self) -> Option<&'static str> {
        match self {
            RunState::Active(sub) => Some(match sub {
                ActiveSub::Executing => "executing",
                ActiveSub::Paused => "paused",
                ActiveSub::Checkpoint => "checkpoint",
            }),
            RunState::Verifying(sub) => Some(match sub {
                VerifyingSub::Testing => "testing",
                VerifyingSub::Passed => "passed",
                VerifyingSub::Failed => "failed",
                VerifyingSub::Fixing => "fixing",
                VerifyingSub::Retesting => "retesting",
            }),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.substate() {
            Some(sub) => write!(f, "{}/{}", self.parent(), sub),
            None => f.write_str(self.parent()),
        }
    }
}

impl FromStr for RunState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATES
            .into_iter()
            .find(|state| state.to_string() == s)
            .ok_or_else(|| TransitionError::UnknownState {
                query: s.to_string(),
            })
    }
}

impl Serialize for RunState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Error raised when a transition cannot be validated.
///
/// Every variant names the valid alternatives so the caller can self-correct
/// without a second round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("unknown state '{query}' (known: proposed, approved, ready, active/<sub>, verifying/<sub>, complete, abandoned)")]
    UnknownState { query: String },

    #[error("invalid transition {from} -> {target} (allowed: {})", format_list(allowed))]
    Invalid {
        from: String,
        target: String,
        allowed: Vec<String>,
    },

    #[error("ambiguous target '{target}' from {from} (candidates: {})", format_list(candidates))]
    Ambiguous {
        from: String,
        target: String,
        candidates: Vec<String>,
    },
}

fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return "none; state is terminal".to_string();
    }
    items.join(", ")
}

/// Allowed transition targets from `from`, in table order.
pub fn allowed_targets(from: RunState) -> &'static [RunState] {
    match from {
        RunState::Proposed => &[RunState::Approved, RunState::Abandoned],
        RunState::Approved => &[RunState::Ready, RunState::Abandoned],
        RunState::Ready => &[RunState::Active(ActiveSub::Executing), RunState::Abandoned],
        RunState::Active(ActiveSub::Executing) => &[
            RunState::Active(ActiveSub::Paused),
            RunState::Active(ActiveSub::Checkpoint),
            RunState::Verifying(VerifyingSub::Testing),
            RunState::Abandoned,
        ],
        RunState::Active(ActiveSub::Paused) => &[
            RunState::Active(ActiveSub::Executing),
            RunState::Abandoned,
        ],
        RunState::Active(ActiveSub::Checkpoint) => &[RunState::Active(ActiveSub::Executing)],
        RunState::Verifying(VerifyingSub::Testing) => &[
            RunState::Verifying(VerifyingSub::Passed),
            RunState::Verifying(VerifyingSub::Failed),
            RunState::Active(ActiveSub::Executing),
        ],
        RunState::Verifying(VerifyingSub::Passed) => &[
            RunState::Complete,
            RunState::Active(ActiveSub::Executing),
        ],
        RunState::Verifying(VerifyingSub::Failed) => &[
            RunState::Verifying(VerifyingSub::Fixing),
            RunState::Active(ActiveSub::Executing),
        ],
        RunState::Verifying(VerifyingSub::Fixing) => &[
            RunState::Verifying(VerifyingSub::Retesting),
            RunState::Active(ActiveSub::Executing),
        ],
        RunState::Verifying(VerifyingSub::Retesting) => &[
            RunState::Verifying(VerifyingSub::Passed),
            RunState::Verifying(VerifyingSub::Failed),
            RunState::Active(ActiveSub::Executing),
        ],
        RunState::Complete => &[RunState::Active(ActiveSub::Executing)],
        RunState::Abandoned => &[],
    }
}

/// Test whether `state` matches a query.
///
/// Three query shapes: exact (`"verifying/failed"`), parent-only
/// (`"verifying"`), and explicit wildcard (`"verifying/*"`, same as
/// parent-only).
pub fn match_state(state: RunState, query: &str) -> bool {
    if let Some(parent) = query.strip_suffix("/*") {
        return state.parent() == parent;
    }
    if !query.contains('/') {
        return state.parent() == query;
    }
    state.to_string() == query
}

/// Resolve a target query against the allowed edges out of `from`.
///
/// An exact state must be an allowed target. A parent-only or wildcard query
/// must match exactly one allowed edge; matching several is ambiguous and the
/// caller must name the substate.
pub fn resolve_target(from: RunState, query: &str) -> Result<RunState, TransitionError> {
    let allowed = allowed_targets(from);

    if let Ok(exact) = query.parse::<RunState>() {
        if allowed.contains(&exact) {
            return Ok(exact);
        }
        return Err(invalid(from, query, allowed));
    }

    let looks_like_query = query.ends_with("/*") || !query.contains('/');
    if !looks_like_query {
        return Err(TransitionError::UnknownState {
            query: query.to_string(),
        });
    }

    let candidates: Vec<RunState> = allowed
        .iter()
        .copied()
        .filter(|target| match_state(*target, query))
        .collect();
    match candidates.as_slice() {
        [] => Err(invalid(from, query, allowed)),
        [only] => Ok(*only),
        many => Err(TransitionError::Ambiguous {
            from: from.to_string(),
            target: query.to_string(),
            candidates: many.iter().map(RunState::to_string).collect(),
        }),
    }
}

fn invalid(from: RunState, target: &str, allowed: &[RunState]) -> TransitionError {
    TransitionError::Invalid {
        from: from.to_string(),
        target: target.to_string(),
        allowed: allowed.iter().map(RunState::to_string).collect(),
    }
}

/// Shortest valid path from `from` to `to`, excluding `from` itself.
///
/// Intermediate hops are restricted to `active/*` and `verifying/*` so the
/// search never routes through terminal or pre-execution states. Returns
/// `None` when no such path exists; `Some(vec![])` when already at `to`.
pub fn transition_path(from: RunState, to: RunState) -> Option<Vec<RunState>> {
    if from == to {
        return Some(Vec::new());
    }

    let mut queue = VecDeque::from([vec![from]]);
    let mut seen = vec![from];

    while let Some(path) = queue.pop_front() {
        let last = *path.last().expect("path is never empty");
        for next in allowed_targets(last) {
            if *next == to {
                let mut found = path.clone();
                found.push(*next);
                found.remove(0);
                return Some(found);
            }
            let intermediate = matches!(next, RunState::Active(_) | RunState::Verifying(_));
            if intermediate && !seen.contains(next) {
                seen.push(*next);
                let mut extended = path.clone();
                extended.push(*next);
                queue.push_back(extended);
            }
        }
    }

    None
}
