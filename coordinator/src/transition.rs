//! Orchestration for applying lifecycle transitions to stored runs.
//!
//! The validated path and the forced escape hatch are separate entry points
//! on purpose: call sites cannot drift into bypassing validation by flipping
//! a boolean on the normal path.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::run::Run;
use crate::core::state::{RunState, TransitionError, resolve_target};
use crate::io::audit::{AuditEntry, AuditLog};
use crate::io::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Invalid(#[from] TransitionError),

    #[error("run '{id}' is claimed by '{holder}' until {expires}; actor '{actor}' does not hold the claim")]
    NotClaimHolder {
        id: String,
        holder: String,
        actor: String,
        expires: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub run: Run,
    pub from: RunState,
    pub to: RunState,
}

/// Validate and apply one transition.
///
/// `target` may be an exact state, a parent, or a `parent/*` wildcard; it is
/// resolved against the transition table. Rejections name the allowed
/// alternatives and leave the run untouched.
pub fn apply_transition(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    target: &str,
    actor: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, ApplyError> {
    let mut run = store.load(id)?;
    gate_claim_holder(&run, actor, now)?;

    let from = run.state;
    let to = resolve_target(from, target)?;
    run.record_transition(to, now, actor, reason, false);
    store.save(&mut run)?;

    audit.record(&AuditEntry::new(
        now,
        id,
        "transition",
        serde_json::json!({
            "from": from.to_string(),
            "to": to.to_string(),
            "by": actor,
            "reason": reason,
        }),
    ));
    info!(id, from = %from, to = %to, by = actor, "transition applied");
    Ok(TransitionOutcome { run, from, to })
}

/// Apply a transition with validation bypassed.
///
/// The target must still be a real state, but no edge or claim checks run.
/// The transition record is tagged as forced and the audit entry is loud; a
/// forced escape must never be indistinguishable from a validated operation.
pub fn force_transition(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    target: &str,
    actor: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, ApplyError> {
    let mut run = store.load(id)?;
    let to: RunState = target.parse()?;
    let from = run.state;
    run.record_transition(to, now, actor, reason, true);
    store.save(&mut run)?;

    audit.record(
        &AuditEntry::new(
            now,
            id,
            "transition",
            serde_json::json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "by": actor,
                "reason": reason,
            }),
        )
        .forced(),
    );
    warn!(id, from = %from, to = %to, by = actor, "transition forced, validation bypassed");
    Ok(TransitionOutcome { run, from, to })
}

/// Transitions are gated by claim ownership: a foreign non-expired claim
/// blocks everyone but its holder.
pub(crate) fn gate_claim_holder(
    run: &Run,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<(), ApplyError> {
    if let Some(claim) = run.active_claim_at(now)
        && claim.claimed_by != actor
    {
        return Err(ApplyError::NotClaimHolder {
            id: run.id.clone(),
            holder: claim.claimed_by.clone(),
            actor: actor.to_string(),
            expires: claim.claim_expires,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::Claim;
    use crate::core::state::ActiveSub;
    use chrono::TimeDelta;

    fn setup() -> (tempfile::TempDir, RunStore, AuditLog) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let audit = AuditLog::new(temp.path());
        (temp, store, audit)
    }

    fn seed(store: &RunStore, id: &str) -> Run {
        let mut run = Run::new(id, format!("plans/{id}.md"));
        store.create(&mut run).expect("create");
        run
    }

    #[test]
    fn valid_transition_is_applied_and_persisted() {
        let (_temp, store, audit) = setup();
        seed(&store, "run-1");

        let outcome = apply_transition(
            &store,
            &audit,
            "run-1",
            "approved",
            "reviewer",
            Some("lgtm"),
            Utc::now(),
        )
        .expect("apply");
        assert_eq!(outcome.from, RunState::Proposed);
        assert_eq!(outcome.to, RunState::Approved);

        let reloaded = store.load("run-1").expect("reload");
        assert_eq!(reloaded.state, RunState::Approved);
        assert_eq!(reloaded.transitions.len(), 1);
        assert!(!reloaded.transitions[0].forced);
    }

    /// Rejections leave the run untouched and carry the allowed edges.
    #[test]
    fn invalid_transition_reports_and_mutates_nothing() {
        let (_temp, store, audit) = setup();
        seed(&store, "run-1");

        let err = apply_transition(
            &store,
            &audit,
            "run-1",
            "complete",
            "agent-a",
            None,
            Utc::now(),
        )
        .expect_err("invalid");
        match err {
            ApplyError::Invalid(TransitionError::Invalid { allowed, .. }) => {
                assert_eq!(allowed, vec!["approved", "abandoned"]);
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }

        let reloaded = store.load("run-1").expect("reload");
        assert_eq!(reloaded.state, RunState::Proposed);
        assert!(reloaded.transitions.is_empty());
    }

    #[test]
    fn parent_target_resolves_single_edge() {
        let (_temp, store, audit) = setup();
        let mut run = seed(&store, "run-1");
        run.state = RunState::Ready;
        store.save(&mut run).expect("save");

        let outcome =
            apply_transition(&store, &audit, "run-1", "active", "agent-a", None, Utc::now())
                .expect("apply");
        assert_eq!(outcome.to, RunState::Active(ActiveSub::Executing));
    }

    /// Forcing records a tagged transition and a forced audit entry.
    #[test]
    fn forced_transition_is_loud_in_the_audit_trail() {
        let (_temp, store, audit) = setup();
        seed(&store, "run-1");

        let outcome = force_transition(
            &store,
            &audit,
            "run-1",
            "complete",
            "operator",
            Some("manual override"),
            Utc::now(),
        )
        .expect("force");
        assert_eq!(outcome.to, RunState::Complete);

        let reloaded = store.load("run-1").expect("reload");
        assert!(reloaded.transitions[0].forced);

        let log = std::fs::read_to_string(audit.path()).expect("audit");
        let entry: serde_json::Value =
            serde_json::from_str(log.lines().last().expect("entry")).expect("parse");
        assert_eq!(entry["forced"], true);
    }

    #[test]
    fn foreign_claim_blocks_transition() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        let mut run = seed(&store, "run-1");
        run.claim = Some(Claim {
            claimed_by: "agent-a".to_string(),
            claimed_at: now,
            claim_expires: now + TimeDelta::minutes(30),
        });
        store.save(&mut run).expect("save");

        let err = apply_transition(&store, &audit, "run-1", "approved", "agent-b", None, now)
            .expect_err("blocked");
        assert!(matches!(err, ApplyError::NotClaimHolder { .. }));

        // The holder itself may proceed.
        apply_transition(&store, &audit, "run-1", "approved", "agent-a", None, now)
            .expect("holder transition");
    }

    #[test]
    fn expired_claim_does_not_block() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        let mut run = seed(&store, "run-1");
        run.claim = Some(Claim {
            claimed_by: "agent-a".to_string(),
            claimed_at: now - TimeDelta::hours(2),
            claim_expires: now - TimeDelta::hours(1),
        });
        store.save(&mut run).expect("save");

        apply_transition(&store, &audit, "run-1", "approved", "agent-b", None, now)
            .expect("expired claim ignored");
    }
}
