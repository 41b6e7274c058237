//! Test-only helpers for constructing runs, plans, and canned check runners.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};

use crate::core::ledger::CheckStatus;
use crate::core::run::{Claim, Run};
use crate::core::state::RunState;
use crate::io::executor::{CheckExecution, CheckRequest, CheckRunner};

/// Create a run in an arbitrary state with deterministic defaults.
pub fn run_in_state(id: &str, plan_path: impl Into<PathBuf>, state: RunState) -> Run {
    let mut run = Run::new(id, plan_path);
    run.state = state;
    run
}

/// Create a claim held by `agent` from `now` for `ttl_mins` minutes.
pub fn claim_for(agent: &str, now: DateTime<Utc>, ttl_mins: i64) -> Claim {
    Claim {
        claimed_by: agent.to_string(),
        claimed_at: now,
        claim_expires: now + TimeDelta::minutes(ttl_mins),
    }
}

/// Write a minimal plan document with the given verification block body.
pub fn write_plan(dir: &Path, id: &str, verification: &str) -> PathBuf {
    let path = dir.join(format!("{id}.md"));
    let text = format!("# Plan {id}\n\n## Verification\n\n{verification}\n");
    std::fs::write(&path, text).expect("write plan");
    path
}

/// Check runner that returns the same status for every command, without
/// spawning processes.
#[derive(Debug, Clone)]
pub struct StaticRunner {
    pub status: CheckStatus,
    pub exit_code: Option<i32>,
}

impl StaticRunner {
    pub fn passing() -> Self {
        Self {
            status: CheckStatus::Pass,
            exit_code: Some(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            status: CheckStatus::Fail,
            exit_code: Some(1),
        }
    }
}

impl CheckRunner for StaticRunner {
    fn run(&self, request: &CheckRequest) -> CheckExecution {
        CheckExecution {
            status: self.status,
            exit_code: self.exit_code,
            output_tail: format!("ran: {}", request.cmd),
            truncated: false,
        }
    }
}
