//! Stable exit codes for `patch-agent` commands.

/// Change verified and published, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid input, configuration or precondition (dirty worktree, git failure).
pub const INVALID: i32 = 1;
/// The repair loop failed: attempts or repair exhausted, or the harness could not start.
pub const FAILED: i32 = 2;
/// The change was committed locally but could not be published.
pub const PUBLISH_FAILED: i32 = 3;
