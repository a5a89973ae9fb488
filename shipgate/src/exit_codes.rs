//! Stable exit codes for shipgate CLI commands.

/// Command succeeded, or the checked artifact is acceptable.
pub const OK: i32 = 0;
/// Invalid input, config or transition, or any other error.
pub const INVALID: i32 = 1;
/// A gate or readiness check blocked shipping.
pub const BLOCKED: i32 = 2;
/// A trust bundle failed signature or key verification.
pub const INTEGRITY: i32 = 3;
