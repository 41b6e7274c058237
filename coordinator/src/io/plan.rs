//! Reading plan documents and locating their verification block.
//!
//! Plans are externally owned; the engine only cares about finding the
//! verification block inside whatever text the plan holds. Check definitions
//! are always re-parsed from the current plan text at the moment of use, never
//! cached, so plan edits take effect without a migration step.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// Read the plan document. A missing file is an error here; callers that
/// tolerate orphaned runs check [`plan_exists`] first.
pub fn read_plan_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))
}

pub fn plan_exists(path: &Path) -> bool {
    path.is_file()
}

/// Locate the verification block within a plan document.
///
/// The block is the section under a `Verification` heading (any level, case
/// insensitive), ending at the next heading of the same or higher level. When
/// the section contains a fenced code block, the fence contents are the
/// block; otherwise the section body is. Returns `None` when the plan has no
/// verification section — the empty-format case, not an error.
pub fn extract_verification_block(text: &str) -> Option<String> {
    let heading = Regex::new(r"(?mi)^(#{1,6})\s*verification\b.*$").expect("static regex");
    let caps = heading.captures(text)?;
    let level = caps[1].len();
    let section_start = caps.get(0).expect("whole match").end();

    let rest = &text[section_start..];
    let any_heading = Regex::new(r"(?m)^(#{1,6})\s").expect("static regex");
    let section_end = any_heading
        .captures_iter(rest)
        .find(|caps| caps[1].len() <= level)
        .and_then(|caps| caps.get(0))
        .map(|m| m.start())
        .unwrap_or(rest.len());
    let section = &rest[..section_end];

    let fence = Regex::new(r"(?ms)^```[^\n]*\n(.*?)^```\s*$").expect("static regex");
    if let Some(fenced) = fence.captures(section) {
        return Some(fenced[1].to_string());
    }
    Some(section.trim().to_string())
}

/// Convenience: read a plan and pull out its verification block, treating an
/// absent block as empty.
pub fn read_verification_block(path: &Path) -> Result<String> {
    let text = read_plan_text(path)?;
    Ok(extract_verification_block(&text).unwrap_or_default())
}
