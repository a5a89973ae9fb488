//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They take the current time
//! as an argument, operate on in-memory records and return tagged results.

pub mod auth;
pub mod classifier;
pub mod events;
pub mod governance;
pub mod path;
pub mod policy;
pub mod readiness;
pub mod run;
pub mod run_request;
pub mod trust_bundle;
