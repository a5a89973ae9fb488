//! I/O helpers for shipgate commands.

pub mod config;
pub mod event_log;
pub mod run_store;
pub mod verdict;
pub mod workspace;
