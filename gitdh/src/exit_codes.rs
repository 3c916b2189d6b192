//! Stable exit codes for git-dh CLI commands.

/// Every branch deployed, skipped or was already up to date.
pub const OK: i32 = 0;
/// At least one branch failed to deploy or could not be checked.
pub const FAILED: i32 = 1;
/// Invocation aborted: usage, configuration, state store or installer error.
pub const INVALID: i32 = 2;
