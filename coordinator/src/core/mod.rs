//! Pure, deterministic run-lifecycle logic.
//!
//! Nothing in this module performs I/O or reads ambient state (clock, env);
//! operations that need the current time take it as an argument.

pub mod checks;
pub mod conflict;
pub mod ledger;
pub mod run;
pub mod state;
