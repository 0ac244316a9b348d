//! Build/test harness adapter.
//!
//! A failing test run is a normal outcome reported through [`TestReport`]. Only
//! a harness that cannot be started at all is an error, since no patch can fix
//! a missing toolchain.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::HarnessConfig;
use crate::io::process::run_command;

/// Raw result of one harness invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessOutput {
    /// `None` when the process was killed by a signal or timeout.
    pub exit_code: Option<i32>,
    /// Stdout followed by stderr.
    pub output: String,
}

/// The external build/test harness.
pub trait TestHarness {
    /// `Err` means the harness could not be started.
    fn execute(&self) -> Result<HarnessOutput>;
}

/// Pass/fail verdict plus merged output for repair context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    pub output: String,
}

/// Test Runner Adapter: run the harness once and classify the result.
///
/// Returns the start-failure diagnostic as `Err(String)`.
#[instrument(skip_all)]
pub fn run_tests<H: TestHarness + ?Sized>(harness: &H) -> std::result::Result<TestReport, String> {
    let output = harness.execute().map_err(|err| format!("{err:#}"))?;
    let passed = output.exit_code == Some(0);
    if passed {
        info!("test suite passed");
    } else {
        warn!(exit_code = ?output.exit_code, "test suite failed");
    }
    Ok(TestReport {
        passed,
        output: output.output,
    })
}

/// Harness that runs a configured command in the repository root.
#[derive(Debug, Clone)]
pub struct CommandHarness {
    workdir: PathBuf,
    command: Vec<String>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
}

impl CommandHarness {
    pub fn new(workdir: impl Into<PathBuf>, config: &HarnessConfig) -> Self {
        Self {
            workdir: workdir.into(),
            command: config.command.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

impl TestHarness for CommandHarness {
    #[instrument(skip_all, fields(command = %self.display_command()))]
    fn execute(&self) -> Result<HarnessOutput> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("harness command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        info!(workdir = %self.workdir.display(), "running test harness");
        let output = run_command(cmd, None, self.timeout, self.output_limit_bytes)
            .map_err(|err| anyhow!("start `{}`: {err:#}", self.display_command()))?;
        Ok(HarnessOutput {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            output: output.merged("harness"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness(command: &[&str]) -> CommandHarness {
        let temp = std::env::temp_dir();
        CommandHarness::new(
            temp,
            &HarnessConfig {
                command: command.iter().map(|s| s.to_string()).collect(),
                timeout_secs: None,
                output_limit_bytes: 10_000,
            },
        )
    }

    #[test]
    fn passing_command_reports_pass_with_output() {
        let report = run_tests(&harness(&["sh", "-c", "echo 'Passed! 3 tests'"])).expect("run");
        assert!(report.passed);
        assert!(report.output.contains("Passed! 3 tests"));
    }

    #[test]
    fn failing_command_is_not_an_error_and_merges_streams() {
        let report = run_tests(&harness(&[
            "sh",
            "-c",
            "echo 'Failed ClampTests'; echo 'build warning' >&2; exit 1",
        ]))
        .expect("run");
        assert!(!report.passed);
        assert!(report.output.contains("Failed ClampTests"));
        assert!(report.output.contains("build warning"));
    }

    #[test]
    fn missing_toolchain_is_a_start_error() {
        let err = run_tests(&harness(&["no-such-test-tool-xyz", "test"])).expect_err("start");
        assert!(err.contains("no-such-test-tool-xyz"));
    }

    #[test]
    fn timeout_counts_as_failure() {
        let mut h = harness(&["sh", "-c", "sleep 5"]);
        h.timeout = Some(Duration::from_millis(100));
        let report = run_tests(&h).expect("run");
        assert!(!report.passed);
        assert!(report.output.contains("timed out"));
    }
}
