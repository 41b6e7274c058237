//! Run lifecycle engine: states, verification ledger, and claims.
//!
//! This crate tracks units of work ("runs") from proposal to completion. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (the state machine, check
//!   parsing, status derivation, conflict detection). No I/O, fully testable
//!   in isolation.
//! - **[`io`]**: Side-effecting operations (run persistence, plan access,
//!   check execution, the audit sink). Isolated to enable faking in tests.
//!
//! Orchestration modules ([`intake`], [`transition`], [`claim`], [`recorder`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod claim;
pub mod core;
pub mod exit_codes;
pub mod intake;
pub mod io;
pub mod logging;
pub mod recorder;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod transition;
