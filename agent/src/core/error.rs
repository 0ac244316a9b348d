//! Error taxonomy for the repair loop.
//!
//! [`AttemptError`] values are retryable: the loop folds their text into the
//! next prompt. [`RunError`] values escape the loop and end the session.
//! [`PublicationError`] values are raised after the loop succeeded and never
//! undo the local commit.

use thiserror::Error;

/// Model output contained no recognizable diff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no `{marker}` block found in model output")]
pub struct ExtractionError {
    pub marker: &'static str,
}

/// A structural check rejected the extracted diff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed patch ({check}): {detail}")]
pub struct MalformedPatchError {
    /// Name of the check that failed.
    pub check: &'static str,
    pub detail: String,
}

/// A single generation attempt failed in a way that is retried via re-prompting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("model backend failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Malformed(#[from] MalformedPatchError),
    #[error("git apply --check failed:\n{detail}")]
    ApplyCheck { detail: String },
    #[error("git apply failed:\n{detail}")]
    Apply { detail: String },
}

impl AttemptError {
    /// Short stable label used in logs and attempt metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Backend(_) => "backend",
            AttemptError::Extraction(_) => "extraction",
            AttemptError::Malformed(_) => "malformed",
            AttemptError::ApplyCheck { .. } => "apply_check",
            AttemptError::Apply { .. } => "apply",
        }
    }
}

/// Terminal failure of a session.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("working tree is not clean; commit or stash your changes first:\n{paths}")]
    DirtyWorktree { paths: String },
    #[error("no usable patch after {attempts} generation attempts (round {round}); last error: {last_error}")]
    AttemptsExhausted {
        round: u32,
        attempts: u32,
        last_error: String,
    },
    #[error("tests still failing after one repair attempt:\n{test_output}")]
    RepairExhausted { test_output: String },
    #[error("test harness could not be started: {0}")]
    HarnessStart(String),
    #[error("version control failure: {0:#}")]
    Vcs(anyhow::Error),
    #[error("prompt rendering failed: {0:#}")]
    Prompt(anyhow::Error),
}

impl RunError {
    /// Most recent raw diagnostic, suitable for manual continuation.
    pub fn diagnostic(&self) -> String {
        match self {
            RunError::DirtyWorktree { paths } => paths.clone(),
            RunError::AttemptsExhausted { last_error, .. } => last_error.clone(),
            RunError::RepairExhausted { test_output } => test_output.clone(),
            RunError::HarnessStart(detail) => detail.clone(),
            RunError::Vcs(err) | RunError::Prompt(err) => format!("{err:#}"),
        }
    }
}

/// Failure while publishing an already verified change.
#[derive(Debug, Error)]
pub enum PublicationError {
    #[error("commit failed: {0:#}")]
    Commit(anyhow::Error),
    #[error("nothing to commit after a passing test run")]
    NothingToCommit,
    #[error("push of '{branch}' failed (commit kept locally): {detail}")]
    Push { branch: String, detail: String },
    #[error("pull request creation failed (branch '{branch}' was pushed): {detail}")]
    PullRequest { branch: String, detail: String },
    #[error("auto-merge request failed for {url}: {detail}")]
    AutoMerge { url: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_error_names_check() {
        let err = AttemptError::from(MalformedPatchError {
            check: "balanced_markers",
            detail: "a.csproj: 2 x `<Project` vs 1 x `</Project>`".to_string(),
        });
        assert_eq!(err.kind(), "malformed");
        assert!(err.to_string().contains("balanced_markers"));
    }

    #[test]
    fn attempts_exhausted_diagnostic_is_last_error() {
        let err = RunError::AttemptsExhausted {
            round: 0,
            attempts: 3,
            last_error: "no `diff --git` block found in model output".to_string(),
        };
        assert_eq!(
            err.diagnostic(),
            "no `diff --git` block found in model output"
        );
        assert!(err.to_string().contains("3 generation attempts"));
    }
}
