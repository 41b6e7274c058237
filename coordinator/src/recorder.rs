//! Recording verification outcomes: automated check execution, manual
//! verdicts, and the pass/fail recorder entry points.
//!
//! Every mutation appends ledger events and re-derives status; nothing here
//! writes a status field directly. Lifecycle movement happens through the
//! validated transition table, walked hop by hop.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::checks::{CheckDef, CheckDefKind, CheckParseError, parse_checks};
use crate::core::ledger::{CheckStatus, Derived, OverallStatus, VerificationEvent, derive};
use crate::core::run::{Issue, Run};
use crate::core::state::{RunState, VerifyingSub, match_state, transition_path};
use crate::io::audit::{AuditEntry, AuditLog};
use crate::io::executor::{CheckRequest, CheckRunner, DEFAULT_CHECK_TIMEOUT};
use crate::io::plan::{plan_exists, read_verification_block};
use crate::io::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Checks(#[from] CheckParseError),

    #[error("failed to read plan for run '{id}': {source}")]
    Plan {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("run '{id}' is in state '{state}'; verification requires an active or verifying run")]
    WrongState { id: String, state: RunState },

    #[error("unknown check '{name}' (known: {})", known.join(", "))]
    UnknownCheck { name: String, known: Vec<String> },

    #[error("check '{name}' is automated; record results by running it")]
    NotManual { name: String },

    #[error("manual checks still pending: {}", names.join(", "))]
    ManualPending { names: Vec<String> },

    #[error("recording a failure requires a non-empty issue description")]
    MissingIssue,

    #[error("run '{id}' is claimed by '{holder}'; actor '{actor}' does not hold the claim")]
    NotClaimHolder {
        id: String,
        holder: String,
        actor: String,
    },
}

/// A human or agent judgment on a manual check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualVerdict {
    Pass,
    Fail,
}

impl ManualVerdict {
    fn status(self) -> CheckStatus {
        match self {
            ManualVerdict::Pass => CheckStatus::Pass,
            ManualVerdict::Fail => CheckStatus::Fail,
        }
    }
}

/// What a recorder entry point did, with derived status after the fact.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub run_id: String,
    pub state: RunState,
    pub derived: Derived,
    /// Set when a gate was skipped (e.g. manual checks bypassed); the outcome
    /// carries the asterisk so callers cannot mistake it for a clean pass.
    pub flagged: bool,
    pub warnings: Vec<String>,
}

fn gate_claim_holder(run: &Run, actor: &str, now: DateTime<Utc>) -> Result<(), RecordError> {
    if let Some(claim) = run.active_claim_at(now)
        && claim.claimed_by != actor
    {
        return Err(RecordError::NotClaimHolder {
            id: run.id.clone(),
            holder: claim.claimed_by.clone(),
            actor: actor.to_string(),
        });
    }
    Ok(())
}

fn gate_verification_state(run: &Run) -> Result<(), RecordError> {
    if match_state(run.state, "active") || match_state(run.state, "verifying") {
        return Ok(());
    }
    Err(RecordError::WrongState {
        id: run.id.clone(),
        state: run.state,
    })
}

/// Load and parse the run's check definitions. A missing plan file is an
/// orphaned-run situation: zero checks plus a warning, not an error.
fn load_defs(run: &Run, warnings: &mut Vec<String>) -> Result<Vec<CheckDef>, RecordError> {
    if !plan_exists(&run.plan_path) {
        warnings.push(format!(
            "plan file missing: {}; treating check list as empty",
            run.plan_path.display()
        ));
        return Ok(Vec::new());
    }
    let block = read_verification_block(&run.plan_path).map_err(|source| RecordError::Plan {
        id: run.id.clone(),
        source,
    })?;
    Ok(parse_checks(&block)?)
}

/// Walk the run to `to` through validated intermediate hops, recording each
/// one. An unreachable target degrades to a warning; verification results are
/// already durable by the time this runs.
fn walk_to(
    run: &mut Run,
    to: RunState,
    actor: &str,
    now: DateTime<Utc>,
    warnings: &mut Vec<String>,
) {
    match transition_path(run.state, to) {
        Some(path) => {
            for hop in path {
                run.record_transition(hop, now, actor, Some("auto"), false);
            }
        }
        None => warnings.push(format!(
            "no valid transition path from '{}' to '{to}'; state left unchanged",
            run.state
        )),
    };
}

/// Execute every automated check in the plan, appending ledger events as each
/// finishes. Manual checks are never executed. From an `active` substate the
/// run auto-enters `verifying/testing` first.
#[instrument(skip_all, fields(id = %id, actor = %actor))]
pub fn run_checks(
    store: &RunStore,
    audit: &AuditLog,
    runner: &dyn CheckRunner,
    id: &str,
    actor: &str,
    workdir: &Path,
    default_timeout: Duration,
    now: DateTime<Utc>,
) -> Result<VerifyOutcome, RecordError> {
    let mut run = store.load(id)?;
    gate_claim_holder(&run, actor, now)?;
    gate_verification_state(&run)?;

    let mut warnings = Vec::new();
    let defs = load_defs(&run, &mut warnings)?;

    if match_state(run.state, "active") {
        walk_to(
            &mut run,
            RunState::Verifying(VerifyingSub::Testing),
            actor,
            now,
            &mut warnings,
        );
    }

    let planned: Vec<String> = defs.iter().map(|def| def.name.clone()).collect();
    run.verification_mut()
        .events
        .push(VerificationEvent::RunStarted {
            at: now,
            checks_planned: planned.clone(),
        });
    store.save(&mut run)?;
    audit.record(&AuditEntry::new(
        now,
        id,
        "verify_run",
        serde_json::json!({ "by": actor, "checks_planned": planned }),
    ));

    for def in &defs {
        let CheckDefKind::Cmd { cmd, timeout } = &def.kind else {
            continue;
        };
        let request = CheckRequest {
            workdir: workdir.to_path_buf(),
            cmd: cmd.clone(),
            timeout: timeout.unwrap_or(default_timeout),
        };
        let execution = runner.run(&request);
        info!(check = %def.name, status = ?execution.status, "check executed");
        run.verification_mut()
            .events
            .push(VerificationEvent::CheckExecuted {
                at: now,
                name: def.name.clone(),
                status: execution.status,
                exit_code: execution.exit_code,
                output_tail: execution.output_tail,
                truncated: execution.truncated,
            });
        // Persist after every check so a crash mid-suite loses at most the
        // in-flight check.
        store.save(&mut run)?;
        audit.record(&AuditEntry::new(
            now,
            id,
            "check_executed",
            serde_json::json!({
                "name": def.name,
                "status": execution.status,
                "exit_code": execution.exit_code,
            }),
        ));
    }

    let derived = derive(run.events(), &defs);
    Ok(VerifyOutcome {
        run_id: run.id,
        state: run.state,
        derived,
        flagged: false,
        warnings,
    })
}

/// Record overall verification success, walking the run to `verifying/passed`.
///
/// Pending manual checks block the pass unless `skip_manual` is set, in which
/// case the outcome is flagged and the audit entry marked forced. Pending
/// automated checks warn but do not block. Calling this on a run that already
/// reached `complete` is a no-op success.
#[instrument(skip_all, fields(id = %id, by = %by))]
pub fn record_pass(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    by: &str,
    skip_manual: bool,
    now: DateTime<Utc>,
) -> Result<VerifyOutcome, RecordError> {
    let mut run = store.load(id)?;
    gate_claim_holder(&run, by, now)?;

    // A completed run is accepted as-is; verifying/passed re-validates but
    // does not move. Everything else must be in a verification-capable state.
    let already_complete = run.state == RunState::Complete;
    let already_passed = run.state == RunState::Verifying(VerifyingSub::Passed);
    if !already_complete && !already_passed {
        gate_verification_state(&run)?;
    }

    let mut warnings = Vec::new();
    let defs = load_defs(&run, &mut warnings)?;
    let derived = derive(run.events(), &defs);

    let pending_manual = derived.pending_manual_names();
    let mut flagged = false;
    if !already_complete {
        if !pending_manual.is_empty() {
            if !skip_manual {
                return Err(RecordError::ManualPending {
                    names: pending_manual,
                });
            }
            flagged = true;
            warnings.push(format!(
                "manual checks skipped: {}",
                pending_manual.join(", ")
            ));
        }
        let pending_cmd = derived.pending_cmd_names();
        if !pending_cmd.is_empty() {
            warnings.push(format!(
                "automated checks never executed: {}",
                pending_cmd.join(", ")
            ));
        }
    }

    if !already_complete && !already_passed {
        walk_to(
            &mut run,
            RunState::Verifying(VerifyingSub::Passed),
            by,
            now,
            &mut warnings,
        );
        store.save(&mut run)?;
    }

    let mut entry = AuditEntry::new(
        now,
        id,
        "verify_pass",
        serde_json::json!({ "by": by, "skipped_manual": flagged.then_some(&pending_manual) }),
    );
    if flagged {
        entry = entry.forced();
        warn!(id, by, skipped = ?pending_manual, "pass recorded with manual checks skipped");
    }
    audit.record(&entry);

    Ok(VerifyOutcome {
        run_id: run.id,
        state: run.state,
        derived,
        flagged,
        warnings,
    })
}

/// Record overall verification failure with a structured issue, walking the
/// run to `verifying/failed`.
///
/// The issue is persisted before any transition, so a failed walk loses
/// nothing but the state change.
#[instrument(skip_all, fields(id = %id, by = %by))]
pub fn record_fail(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    by: &str,
    issue: &str,
    now: DateTime<Utc>,
) -> Result<VerifyOutcome, RecordError> {
    if issue.trim().is_empty() {
        return Err(RecordError::MissingIssue);
    }
    let mut run = store.load(id)?;
    gate_claim_holder(&run, by, now)?;
    gate_verification_state(&run)?;

    let mut warnings = Vec::new();
    let defs = load_defs(&run, &mut warnings)?;

    let verification = run.verification_mut();
    let issue_id = verification.next_issue_id();
    verification.issues.push(Issue {
        id: issue_id,
        description: issue.trim().to_string(),
        by: by.to_string(),
        at: now,
    });
    store.save(&mut run)?;

    walk_to(
        &mut run,
        RunState::Verifying(VerifyingSub::Failed),
        by,
        now,
        &mut warnings,
    );
    store.save(&mut run)?;

    audit.record(&AuditEntry::new(
        now,
        id,
        "verify_fail",
        serde_json::json!({ "by": by, "issue_id": issue_id, "issue": issue.trim() }),
    ));
    info!(id, issue_id, "failure recorded");

    let derived = derive(run.events(), &defs);
    Ok(VerifyOutcome {
        run_id: run.id,
        state: run.state,
        derived,
        flagged: false,
        warnings,
    })
}

/// Record a verdict for one named manual check.
///
/// When the verdict settles the whole check list the run auto-walks to
/// `verifying/passed` or `verifying/failed`; otherwise it stays put.
#[instrument(skip_all, fields(id = %id, check = %check, by = %by))]
pub fn record_manual(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    check: &str,
    verdict: ManualVerdict,
    reason: Option<&str>,
    by: &str,
    now: DateTime<Utc>,
) -> Result<VerifyOutcome, RecordError> {
    let mut run = store.load(id)?;
    gate_claim_holder(&run, by, now)?;
    gate_verification_state(&run)?;

    let mut warnings = Vec::new();
    let defs = load_defs(&run, &mut warnings)?;

    let Some(def) = defs.iter().find(|def| def.name == check) else {
        return Err(RecordError::UnknownCheck {
            name: check.to_string(),
            known: defs.iter().map(|def| def.name.clone()).collect(),
        });
    };
    if !def.is_manual() {
        return Err(RecordError::NotManual {
            name: check.to_string(),
        });
    }

    run.verification_mut()
        .events
        .push(VerificationEvent::ManualRecorded {
            at: now,
            name: check.to_string(),
            status: verdict.status(),
            reason: reason.map(str::to_string),
            by: by.to_string(),
        });
    store.save(&mut run)?;

    let derived = derive(run.events(), &defs);
    match derived.overall {
        OverallStatus::Pass => {
            walk_to(
                &mut run,
                RunState::Verifying(VerifyingSub::Passed),
                by,
                now,
                &mut warnings,
            );
            store.save(&mut run)?;
        }
        OverallStatus::Fail if !derived.manual_pending => {
            walk_to(
                &mut run,
                RunState::Verifying(VerifyingSub::Failed),
                by,
                now,
                &mut warnings,
            );
            store.save(&mut run)?;
        }
        _ => {}
    }

    audit.record(&AuditEntry::new(
        now,
        id,
        "manual_recorded",
        serde_json::json!({
            "check": check,
            "status": verdict.status(),
            "reason": reason,
            "by": by,
        }),
    ));
    info!(id, check, verdict = ?verdict, "manual verdict recorded");

    Ok(VerifyOutcome {
        run_id: run.id,
        state: run.state,
        derived,
        flagged: false,
        warnings,
    })
}

/// Default timeout re-exported for callers wiring up the recorder.
pub const DEFAULT_TIMEOUT: Duration = DEFAULT_CHECK_TIMEOUT;
