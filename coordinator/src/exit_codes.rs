//! Stable exit codes for coordinator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid input: unknown run, bad transition, malformed checks, or other errors.
pub const INVALID: i32 = 1;
/// Claim rejected due to file-overlap conflicts with another run.
pub const CONFLICT: i32 = 2;
/// Operation blocked by another agent's claim or by pending manual checks.
pub const BLOCKED: i32 = 3;
