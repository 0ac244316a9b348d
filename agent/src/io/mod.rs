//! Side-effecting adapters: git, processes, HTTP backends, and on-disk state.

pub mod attempt_log;
pub mod config;
pub mod git;
pub mod harness;
pub mod hosting;
pub mod model;
pub mod process;
pub mod prompt;
