//! Exclusive execution leases on runs, with file-overlap admission control.
//!
//! A claim is a wall-clock lease, not a distributed lock: TTL expiry plus
//! garbage collection is the crash-recovery story. At most one intended
//! writer holds a run at a time; the holder may renew its own lease.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::conflict::{Conflict, detect_conflicts};
use crate::core::run::Claim;
use crate::io::audit::{AuditEntry, AuditLog};
use crate::io::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run '{id}' is already claimed by '{by}' until {expires}")]
    AlreadyClaimed {
        id: String,
        by: String,
        expires: DateTime<Utc>,
    },

    #[error("claiming '{id}' conflicts with: {}", format_conflicts(conflicts))]
    Conflicts { id: String, conflicts: Vec<Conflict> },
}

fn format_conflicts(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(Conflict::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a successful claim. Overridden obstacles are reported, never
/// silently discarded.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub claim: Claim,
    pub overrode_holder: Option<String>,
    pub overrode_conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredClaim {
    pub run_id: String,
    pub claimed_by: String,
    pub claim_expires: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    pub expired: Vec<ExpiredClaim>,
    pub dry_run: bool,
}

/// Grant `agent` an exclusive lease on `id` for `ttl`.
///
/// Rejected when another agent holds a non-expired claim or when
/// `files_touched` overlaps an active-ish run; `force` turns both rejections
/// into reported overrides. The holder renewing its own claim is a normal
/// success.
pub fn claim(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    agent: &str,
    ttl: TimeDelta,
    force: bool,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome, ClaimError> {
    let mut run = store.load(id)?;

    let mut overrode_holder = None;
    if let Some(existing) = run.active_claim_at(now)
        && existing.claimed_by != agent
    {
        if !force {
            return Err(ClaimError::AlreadyClaimed {
                id: id.to_string(),
                by: existing.claimed_by.clone(),
                expires: existing.claim_expires,
            });
        }
        overrode_holder = Some(existing.claimed_by.clone());
    }

    let others = store.list()?;
    let conflicts = detect_conflicts(&run, &others, now);
    let overrode_conflicts = if conflicts.is_empty() {
        Vec::new()
    } else if force {
        conflicts
    } else {
        return Err(ClaimError::Conflicts {
            id: id.to_string(),
            conflicts,
        });
    };

    let claim = Claim {
        claimed_by: agent.to_string(),
        claimed_at: now,
        claim_expires: now + ttl,
    };
    run.claim = Some(claim.clone());
    store.save(&mut run)?;

    let mut entry = AuditEntry::new(
        now,
        id,
        "claim",
        serde_json::json!({
            "agent": agent,
            "expires": claim.claim_expires,
            "overrode_holder": overrode_holder,
            "overrode_conflicts": overrode_conflicts,
        }),
    );
    if overrode_holder.is_some() || !overrode_conflicts.is_empty() {
        entry = entry.forced();
        warn!(id, agent, "claim forced over existing holder or conflicts");
    }
    audit.record(&entry);
    info!(id, agent, expires = %claim.claim_expires, "claim granted");

    Ok(ClaimOutcome {
        claim,
        overrode_holder,
        overrode_conflicts,
    })
}

/// Clear a run's claim. Releasing an unclaimed run is a no-op success.
/// Returns whether a claim was actually cleared.
pub fn release(
    store: &RunStore,
    audit: &AuditLog,
    id: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let mut run = store.load(id)?;
    let Some(existing) = run.claim.take() else {
        return Ok(false);
    };
    store.save(&mut run)?;
    audit.record(&AuditEntry::new(
        now,
        id,
        "release",
        serde_json::json!({ "was_held_by": existing.claimed_by }),
    ));
    info!(id, was_held_by = %existing.claimed_by, "claim released");
    Ok(true)
}

/// Find and release expired claims across the whole store.
///
/// In dry-run mode the report lists what would be released without mutating
/// anything.
pub fn gc(
    store: &RunStore,
    audit: &AuditLog,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<GcReport, StoreError> {
    let mut expired = Vec::new();
    for run in store.list()? {
        let Some(claim) = &run.claim else { continue };
        if !claim.is_expired_at(now) {
            continue;
        }
        expired.push(ExpiredClaim {
            run_id: run.id.clone(),
            claimed_by: claim.claimed_by.clone(),
            claim_expires: claim.claim_expires,
        });
        if dry_run {
            continue;
        }
        let mut run = run;
        run.claim = None;
        store.save(&mut run)?;
        audit.record(&AuditEntry::new(
            now,
            &run.id,
            "gc_release",
            serde_json::json!({ "expired": expired.last() }),
        ));
        info!(id = %run.id, "expired claim collected");
    }
    Ok(GcReport { expired, dry_run })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::run::Run;
    use crate::core::state::{ActiveSub, RunState};

    fn setup() -> (tempfile::TempDir, RunStore, AuditLog) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path());
        let audit = AuditLog::new(temp.path());
        (temp, store, audit)
    }

    fn seed(store: &RunStore, id: &str, files: &[&str]) -> Run {
        let mut run = Run::new(id, format!("plans/{id}.md"));
        run.files_touched = files.iter().map(|f| f.to_string()).collect();
        store.create(&mut run).expect("create");
        run
    }

    fn ttl() -> TimeDelta {
        TimeDelta::minutes(30)
    }

    /// Mutual exclusion: the second agent is rejected with
    /// the holder's name; force succeeds and reports the override.
    #[test]
    fn claim_is_mutually_exclusive_until_forced() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        seed(&store, "run-1", &[]);

        claim(&store, &audit, "run-1", "agent-a", ttl(), false, now).expect("first claim");

        let err = claim(&store, &audit, "run-1", "agent-b", ttl(), false, now)
            .expect_err("second claim");
        match err {
            ClaimError::AlreadyClaimed { by, .. } => assert_eq!(by, "agent-a"),
            other => panic!("expected AlreadyClaimed, got {other:?}"),
        }

        let outcome =
            claim(&store, &audit, "run-1", "agent-b", ttl(), true, now).expect("forced claim");
        assert_eq!(outcome.overrode_holder.as_deref(), Some("agent-a"));
        assert_eq!(
            store
                .load("run-1")
                .expect("reload")
                .claim
                .expect("claim")
                .claimed_by,
            "agent-b"
        );
    }

    #[test]
    fn holder_renews_its_own_claim() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        seed(&store, "run-1", &[]);

        claim(&store, &audit, "run-1", "agent-a", ttl(), false, now).expect("claim");
        let renewed = claim(
            &store,
            &audit,
            "run-1",
            "agent-a",
            ttl(),
            false,
            now + TimeDelta::minutes(10),
        )
        .expect("renew");
        assert!(renewed.overrode_holder.is_none());
        assert_eq!(renewed.claim.claim_expires, now + TimeDelta::minutes(40));
    }

    #[test]
    fn expired_claim_does_not_block_a_new_agent() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        seed(&store, "run-1", &[]);

        claim(&store, &audit, "run-1", "agent-a", TimeDelta::minutes(5), false, now)
            .expect("claim");
        let later = now + TimeDelta::minutes(10);
        let outcome =
            claim(&store, &audit, "run-1", "agent-b", ttl(), false, later).expect("reclaim");
        assert!(outcome.overrode_holder.is_none());
    }

    /// File-overlap conflicts block the claim and name the other run; force
    /// reports them instead.
    #[test]
    fn file_overlap_blocks_claim_until_forced() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        let mut active = seed(&store, "run-a", &["x.go"]);
        active.state = RunState::Active(ActiveSub::Executing);
        store.save(&mut active).expect("save");
        seed(&store, "run-b", &["x.go", "y.go"]);

        let err =
            claim(&store, &audit, "run-b", "agent-b", ttl(), false, now).expect_err("conflict");
        match &err {
            ClaimError::Conflicts { conflicts, .. } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].run_id, "run-a");
                assert_eq!(conflicts[0].files, vec!["x.go".to_string()]);
            }
            other => panic!("expected Conflicts, got {other:?}"),
        }
        assert!(err.to_string().contains("run-a"));

        let outcome =
            claim(&store, &audit, "run-b", "agent-b", ttl(), true, now).expect("forced");
        assert_eq!(outcome.overrode_conflicts.len(), 1);

        // Once run-a completes, the claim goes through without force.
        release(&store, &audit, "run-b", now).expect("release");
        let mut done = store.load("run-a").expect("load");
        done.state = RunState::Complete;
        store.save(&mut done).expect("save");
        claim(&store, &audit, "run-b", "agent-b", ttl(), false, now).expect("claim after done");
    }

    #[test]
    fn release_is_idempotent() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        seed(&store, "run-1", &[]);

        claim(&store, &audit, "run-1", "agent-a", ttl(), false, now).expect("claim");
        assert!(release(&store, &audit, "run-1", now).expect("first release"));
        assert!(!release(&store, &audit, "run-1", now).expect("second release"));
        assert!(store.load("run-1").expect("reload").claim.is_none());
    }

    /// gc releases expired claims, leaves live ones, and mutates nothing in
    /// dry-run mode.
    #[test]
    fn gc_collects_only_expired_claims() {
        let (_temp, store, audit) = setup();
        let now = Utc::now();
        seed(&store, "run-old", &[]);
        seed(&store, "run-new", &[]);

        claim(
            &store,
            &audit,
            "run-old",
            "agent-a",
            TimeDelta::minutes(5),
            false,
            now - TimeDelta::minutes(10),
        )
        .expect("old claim");
        claim(&store, &audit, "run-new", "agent-b", ttl(), false, now).expect("new claim");

        let dry = gc(&store, &audit, now, true).expect("dry run");
        assert_eq!(dry.expired.len(), 1);
        assert_eq!(dry.expired[0].run_id, "run-old");
        assert!(store.load("run-old").expect("reload").claim.is_some());

        let real = gc(&store, &audit, now, false).expect("gc");
        assert_eq!(real.expired.len(), 1);
        assert!(store.load("run-old").expect("reload").claim.is_none());
        assert!(store.load("run-new").expect("reload").claim.is_some());
    }
}
