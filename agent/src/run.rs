//! Orchestration for `patch-agent run`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{info, instrument};

use crate::core::error::{PublicationError, RunError};
use crate::core::types::{PatchRecord, Session, Task};
use crate::core::validate::PatchValidator;
use crate::exit_codes;
use crate::io::attempt_log::AttemptLog;
use crate::io::config::AgentConfig;
use crate::io::git::Git;
use crate::io::harness::TestHarness;
use crate::io::hosting::CodeHost;
use crate::io::model::ModelBackend;
use crate::publish::{Publication, publish};
use crate::repair::{LoopSettings, RepairLoop};
use crate::worktree::Worktree;

/// Inputs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub repo: PathBuf,
    pub task_file: PathBuf,
    /// Defaults to `agent/<YYYYMMDD-HHMMSS>`.
    pub branch: Option<String>,
}

/// A verified and published change.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session: Session,
    pub patch: PatchRecord,
    pub publication: Publication,
    pub log_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0:#}")]
    Invalid(anyhow::Error),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Publish(#[from] PublicationError),
}

impl AgentError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Invalid(_) => exit_codes::INVALID,
            AgentError::Run(
                RunError::DirtyWorktree { .. } | RunError::Vcs(_) | RunError::Prompt(_),
            ) => exit_codes::INVALID,
            AgentError::Run(_) => exit_codes::FAILED,
            AgentError::Publish(_) => exit_codes::PUBLISH_FAILED,
        }
    }
}

/// Branch name used when none is given.
pub fn default_branch_name(now: DateTime<Local>) -> String {
    format!("agent/{}", now.format("%Y%m%d-%H%M%S"))
}

/// Read and trim the task file; blank files are rejected.
pub fn read_task(path: &Path) -> anyhow::Result<Task> {
    let raw = fs::read_to_string(path).with_context(|| format!("read task file {}", path.display()))?;
    Task::new(raw).ok_or_else(|| anyhow!("task file {} is empty", path.display()))
}

/// Attempt log root for a run in `repo`.
///
/// Rollback cleans untracked files and publication stages everything, so a
/// `log_dir` inside the working tree is accepted only when git ignores it.
pub fn resolve_log_root(
    git: &Git,
    repo: &Path,
    log_dir: Option<&Path>,
) -> Result<PathBuf, AgentError> {
    let git_dir = git.git_dir().map_err(RunError::Vcs)?;
    let Some(dir) = log_dir else {
        return Ok(AttemptLog::default_root(&git_dir));
    };
    let root = std::path::absolute(repo.join(dir))
        .map(|path| normalize(&path))
        .and_then(|path| resolve_existing_prefix(&path))
        .with_context(|| format!("resolve log_dir {}", dir.display()))
        .map_err(AgentError::Invalid)?;

    let toplevel = git.toplevel().map_err(RunError::Vcs)?;
    if !root.starts_with(&toplevel) || root.starts_with(&git_dir) {
        return Ok(root);
    }
    if git
        .is_ignored(&root.join("session.json"))
        .map_err(RunError::Vcs)?
    {
        return Ok(root);
    }
    Err(AgentError::Invalid(anyhow!(
        "log_dir {} is inside the working tree but not ignored by git; \
         add it to .gitignore or choose a directory outside the repository",
        root.display()
    )))
}

/// Drop `.` and fold `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Check preconditions, create the branch, run the repair loop, and publish.
///
/// `host` is only consulted when a pull request was requested.
#[instrument(skip_all, fields(repo = %options.repo.display()))]
pub fn run_agent<M, H, C>(
    options: &RunOptions,
    config: &AgentConfig,
    model: &M,
    harness: &H,
    host: Option<&C>,
) -> Result<RunReport, AgentError>
where
    M: ModelBackend + ?Sized,
    H: TestHarness + ?Sized,
    C: CodeHost + ?Sized,
{
    let task = read_task(&options.task_file).map_err(AgentError::Invalid)?;
    let validator = PatchValidator::standard(
        config.validator.min_patch_bytes,
        &config.validator.balanced,
    )
    .context("compile validator rules")
    .map_err(AgentError::Invalid)?;

    let git = Git::new(&options.repo);
    // Checked before the branch switch so local edits are never carried over.
    Worktree::new(&git).assert_clean()?;

    let log_root = resolve_log_root(&git, &options.repo, config.log_dir.as_deref())?;

    let started = Local::now();
    let branch = options
        .branch
        .clone()
        .unwrap_or_else(|| default_branch_name(started));
    git.checkout_reset_branch(&branch).map_err(RunError::Vcs)?;
    info!(branch = %branch, "working on branch");

    let log = AttemptLog::new(&log_root, AttemptLog::run_id_at(started));

    let mut session = Session::new(task, branch.clone());
    let patch = RepairLoop::new(model, &git, harness, &validator, LoopSettings::from_config(config))
        .with_attempt_log(&log)
        .run(&mut session)?;

    let publication = publish(&git, host, &config.publish, &branch)?;
    Ok(RunReport {
        session,
        patch,
        publication,
        log_dir: log.run_dir().to_path_buf(),
    })
}
