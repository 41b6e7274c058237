//! Coordinator configuration stored under `<root>/coordinator.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Coordinator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Claim lease duration in minutes.
    pub claim_ttl_mins: u64,

    /// Default per-check timeout in seconds (definition-level overrides win).
    pub check_timeout_secs: u64,

    /// Raw bytes drained per check output stream before tail truncation.
    pub check_output_limit_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_ttl_mins: 30,
            check_timeout_secs: 120,
            check_output_limit_bytes: 65_536,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.claim_ttl_mins == 0 {
            return Err(anyhow!("claim_ttl_mins must be > 0"));
        }
        if self.check_timeout_secs == 0 {
            return Err(anyhow!("check_timeout_secs must be > 0"));
        }
        if self.check_output_limit_bytes == 0 {
            return Err(anyhow!("check_output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_mins * 60)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CoordinatorConfig::default()`.
pub fn load_config(path: &Path) -> Result<CoordinatorConfig> {
    if !path.exists() {
        let cfg = CoordinatorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CoordinatorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CoordinatorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CoordinatorConfig::default());
        assert_eq!(cfg.claim_ttl(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.check_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("coordinator.toml");
        let cfg = CoordinatorConfig {
            claim_ttl_mins: 10,
            ..CoordinatorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cfg = CoordinatorConfig {
            claim_ttl_mins: 0,
            ..CoordinatorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
