//! File-overlap conflict detection across concurrently active runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::run::Run;
use crate::core::state::match_state;

/// An overlap between the file sets two runs intend to modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub run_id: String,
    /// Overlapping paths, in stable sorted order.
    pub files: Vec<String>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.run_id, self.files.join(", "))
    }
}

/// Whether a run counts as occupying its files: in `active/*`, or holding a
/// non-expired claim.
pub fn is_active_ish(run: &Run, now: DateTime<Utc>) -> bool {
    match_state(run.state, "active") || run.active_claim_at(now).is_some()
}

/// Compare `candidate`'s `files_touched` against every active-ish run.
///
/// Returns one conflict per overlapping run, ordered by run id. The candidate
/// itself is skipped.
pub fn detect_conflicts(candidate: &Run, others: &[Run], now: DateTime<Utc>) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = others
        .iter()
        .filter(|other| other.id != candidate.id)
        .filter(|other| is_active_ish(other, now))
        .filter_map(|other| {
            let files: Vec<String> = candidate
                .files_touched
                .intersection(&other.files_touched)
                .cloned()
                .collect();
            if files.is_empty() {
                None
            } else {
                Some(Conflict {
                    run_id: other.id.clone(),
                    files,
                })
            }
        })
        .collect();
    conflicts.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    conflicts
}
