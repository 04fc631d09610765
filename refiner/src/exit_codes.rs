//! Stable exit codes for refiner CLI commands.

/// Command succeeded; for `run` and `batch`, every item was refined.
pub const OK: i32 = 0;
/// Invalid config, work item, template or arguments, or another error.
pub const INVALID: i32 = 1;
/// A run ended without a passing result, or a response had no valid conclusion.
pub const FAILED: i32 = 2;
/// Interrupted before finishing.
pub const CANCELLED: i32 = 3;
