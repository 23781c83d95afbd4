//! Stable exit codes for conductor CLI commands.

/// The operation finished with a success status (`committed`, `executed`, `pruned`, ...).
pub const OK: i32 = 0;
/// Invalid input, configuration, or an unexpected error.
pub const INVALID: i32 = 1;
/// The operation ran but reported an operational failure (`status: error`).
pub const FAILED: i32 = 2;
/// A guardrail refused the request (blocked command, missing test run, ...).
pub const BLOCKED: i32 = 3;
