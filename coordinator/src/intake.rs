//! Registering new runs against externally-owned plan documents.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::run::Run;
use crate::io::audit::{AuditEntry, AuditLog};
use crate::io::plan::plan_exists;
use crate::io::store::{RunStore, StoreError};

#[derive(Debug, Clone)]
pub struct IntakeRequest {
    pub id: String,
    pub plan_path: PathBuf,
    pub initiative: Option<String>,
    pub files_touched: Vec<String>,
    pub priority: Option<u32>,
    pub depends_on: Vec<String>,
}

/// Create a new run record in state `proposed`.
///
/// The plan file is referenced, not owned: a missing plan warns but does not
/// block intake, since plans are often written after the run is registered.
pub fn intake(
    store: &RunStore,
    audit: &AuditLog,
    request: IntakeRequest,
    now: DateTime<Utc>,
) -> Result<Run, StoreError> {
    if !plan_exists(&request.plan_path) {
        warn!(
            id = %request.id,
            plan = %request.plan_path.display(),
            "plan file does not exist yet"
        );
    }

    let mut run = Run::new(&request.id, &request.plan_path);
    run.initiative = request.initiative;
    run.files_touched = request.files_touched.into_iter().collect();
    run.priority = request.priority;
    run.depends_on = request.depends_on;
    store.create(&mut run)?;

    audit.record(&AuditEntry::new(
        now,
        &run.id,
        "intake",
        serde_json::json!({
            "plan_path": run.plan_path,
            "files_touched": run.files_touched,
        }),
    ));
    info!(id = %run.id, plan = %run.plan_path.display(), "run registered");
    Ok(run)
}
