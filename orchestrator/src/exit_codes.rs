//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed: invalid config or state, a halted run, or any other error.
pub const ERROR: i32 = 1;
