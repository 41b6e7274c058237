//! Side-effecting operations: run persistence, plan access, check execution,
//! the audit sink, and configuration. Kept separate from `core` so the
//! deterministic logic stays testable in isolation.

pub mod audit;
pub mod config;
pub mod executor;
pub mod plan;
pub mod store;
