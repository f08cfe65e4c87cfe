//! Application review engine: deduplicating intake of form submissions, a one-vote-per-reviewer
//! ledger, and a decision engine that finalizes each application exactly once.

pub mod config;
pub mod error;
pub mod review;
pub mod telemetry;
