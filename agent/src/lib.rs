//! Autonomous patch agent.
//!
//! Turns a natural-language task into a verified change: a model proposes a
//! unified diff, the diff is extracted, validated and applied to a clean
//! worktree, the test harness decides, and one repair round may follow before
//! the result is committed, pushed and optionally opened as a pull request.
//!
//! - **[`core`]**: Pure, deterministic logic (extraction, structural checks,
//!   session bookkeeping, error taxonomy). No I/O.
//! - **[`io`]**: Side-effecting adapters (git, processes, HTTP backends,
//!   config, attempt log), each behind a trait so tests can script them.
//!
//! Controllers ([`worktree`], [`repair`], [`publish`]) and the command
//! modules ([`run`], [`check`]) combine the two.

pub mod check;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod publish;
pub mod repair;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worktree;
