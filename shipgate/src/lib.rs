//! Governed build pipeline with a background-run state machine and signed
//! release bundles.
//!
//! A run walks planning, structure, build and audit stages. Plans and
//! structures pass governance gates judged by a read-only reviewer; a shippable
//! result is sealed into an HMAC-signed trust bundle. The crate keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (run transitions, retry
//!   classification, gate evaluation, readiness, bundle signing). No I/O.
//! - **[`io`]**: Side-effecting operations (config, run records, event logs,
//!   verdict parsing, project files).
//!
//! [`pipeline`] coordinates core logic with the agent seams in [`agents`] to
//! drive one attempt of a run.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
