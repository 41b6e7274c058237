//! Durable run records: one JSON file per run with optimistic versioning.
//!
//! The version token is the file's mtime captured at load. "Unchanged" means
//! unchanged at filesystem mtime granularity; this is the deliberate weak
//! point of the scheme and is not silently strengthened here. Claims, not the
//! store, are what discourage concurrent intended writers.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::core::run::Run;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run '{id}' not found")]
    NotFound { id: String },

    #[error("run '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("run '{id}' changed on disk since it was loaded (version conflict)")]
    VersionConflict { id: String },

    #[error("run id '{id}' is invalid: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(context: impl Into<String>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        context: context.into(),
        source,
    }
}

/// Validate that an id is safe for use as a `runs/<id>.json` file name.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        Some("must be [A-Za-z0-9._-] only")
    } else if id.starts_with('.') {
        Some("must not start with '.'")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StoreError::InvalidId {
            id: id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// File-backed collection of run records under `<root>/runs/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_path(&self, id: &str) -> PathBuf {
        self.runs_dir().join(format!("{id}.json"))
    }

    /// Persist a new run. Fails if a record with the same id already exists.
    pub fn create(&self, run: &mut Run) -> Result<(), StoreError> {
        validate_id(&run.id)?;
        let path = self.run_path(&run.id);
        if path.exists() {
            return Err(StoreError::AlreadyExists { id: run.id.clone() });
        }
        debug!(id = %run.id, path = %path.display(), "creating run record");
        self.write_record(&path, run)?;
        run.version = Some(self.mtime(&path, &run.id)?);
        Ok(())
    }

    /// Load a run and capture its version token.
    pub fn load(&self, id: &str) -> Result<Run, StoreError> {
        validate_id(id)?;
        let path = self.run_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            Err(err) => return Err(io_err(format!("read {}", path.display()), err)),
        };
        let mut run: Run =
            serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        run.version = Some(self.mtime(&path, id)?);
        debug!(id = %run.id, state = %run.state, "run loaded");
        Ok(run)
    }

    /// Persist an already-loaded run.
    ///
    /// Rejects the write when the file's mtime no longer matches the token
    /// captured at load, i.e. someone else wrote in between. Refreshes the
    /// token on success.
    pub fn save(&self, run: &mut Run) -> Result<(), StoreError> {
        let path = self.run_path(&run.id);
        let Some(token) = run.version else {
            return Err(StoreError::VersionConflict { id: run.id.clone() });
        };
        let current = self.mtime(&path, &run.id)?;
        if current != token {
            return Err(StoreError::VersionConflict { id: run.id.clone() });
        }
        debug!(id = %run.id, state = %run.state, "saving run record");
        self.write_record(&path, run)?;
        run.version = Some(self.mtime(&path, &run.id)?);
        Ok(())
    }

    /// All runs, sorted by id. A missing `runs/` directory is an empty store.
    pub fn list(&self) -> Result<Vec<Run>, StoreError> {
        let dir = self.runs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(format!("read dir {}", dir.display()), err)),
        };

        let mut runs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_err(format!("read dir {}", dir.display()), err))?;
            let path = entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".json"))
            else {
                continue;
            };
            runs.push(self.load(id)?);
        }
        runs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(runs)
    }

    /// Atomically write a record (temp file + rename).
    fn write_record(&self, path: &Path, run: &Run) -> Result<(), StoreError> {
        let parent = path.parent().expect("run path has a parent");
        fs::create_dir_all(parent)
            .map_err(|err| io_err(format!("create directory {}", parent.display()), err))?;
        let mut buf = serde_json::to_string_pretty(run).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .map_err(|err| io_err(format!("write temp record {}", tmp_path.display()), err))?;
        fs::rename(&tmp_path, path)
            .map_err(|err| io_err(format!("replace record {}", path.display()), err))?;
        Ok(())
    }

    fn mtime(&self, path: &Path, id: &str) -> Result<std::time::SystemTime, StoreError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() });
            }
            Err(err) => return Err(io_err(format!("stat {}", path.display()), err)),
        };
        metadata
            .modified()
            .map_err(|err| io_err(format!("mtime {}", path.display()), err))
    }
}
