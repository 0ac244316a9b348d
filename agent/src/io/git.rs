//! Git adapter for the agent.
//!
//! The agent applies model patches and commits the verified result, so we keep
//! a small, explicit wrapper around `git` subprocess calls. Everything else in
//! the crate talks to version control through [`VersionControl`].

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::process::run_command;

/// Bytes of `git apply` diagnostics kept in memory.
const APPLY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Result of feeding a diff to `git apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchApplication {
    Clean,
    /// The tool rejected the diff; `detail` is its diagnostic output.
    Conflict { detail: String },
}

/// Version-control primitives used by the worktree and publication controllers.
///
/// `Err` is reserved for infrastructure failures (git missing, repository
/// broken); a diff that does not apply is a [`PatchApplication::Conflict`].
pub trait VersionControl {
    fn status(&self) -> Result<Vec<StatusEntry>>;
    fn create_or_reset_branch(&self, name: &str) -> Result<()>;
    fn dry_run_apply(&self, diff: &str) -> Result<PatchApplication>;
    fn apply(&self, diff: &str) -> Result<PatchApplication>;
    /// Drop tracked modifications and untracked (non-ignored) files.
    fn discard_all_changes(&self) -> Result<()>;
    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    fn stage_and_commit(&self, message: &str) -> Result<bool>;
    fn push(&self, remote: &str, branch: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Absolute path of the repository's git directory (works for linked worktrees).
    pub fn git_dir(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Absolute path of the working tree root.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// True when `path` is covered by an ignore rule. The path need not exist.
    pub fn is_ignored(&self, path: &Path) -> Result<bool> {
        let arg = path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))?;
        let output = self.run(&["check-ignore", "-q", arg])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git check-ignore {arg} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Create the branch at HEAD, or reset it to HEAD if it already exists, and check it out.
    #[instrument(skip_all, fields(branch = %branch))]
    pub fn checkout_reset_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch at HEAD");
        self.run_checked(&["checkout", "-B", branch])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn apply_patch(&self, diff: &str, check_only: bool) -> Result<PatchApplication> {
        let mut args = vec!["apply", "--whitespace=nowarn"];
        if check_only {
            args.push("--check");
        }
        args.push("-");
        let mut cmd = Command::new("git");
        cmd.args(&args).current_dir(&self.workdir);
        let output = run_command(cmd, Some(diff.as_bytes()), None, APPLY_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if output.status.success() {
            return Ok(PatchApplication::Clean);
        }
        let detail = output.merged("git apply").trim().to_string();
        debug!(check_only, detail = %detail, "git apply rejected diff");
        Ok(PatchApplication::Conflict { detail })
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    fn status(&self) -> Result<Vec<StatusEntry>> {
        self.status_porcelain()
    }

    fn create_or_reset_branch(&self, name: &str) -> Result<()> {
        self.checkout_reset_branch(name)
    }

    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    fn dry_run_apply(&self, diff: &str) -> Result<PatchApplication> {
        self.apply_patch(diff, true)
    }

    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    fn apply(&self, diff: &str) -> Result<PatchApplication> {
        self.apply_patch(diff, false)
    }

    #[instrument(skip_all)]
    fn discard_all_changes(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        debug!("discarded all uncommitted changes");
        Ok(())
    }

    fn stage_and_commit(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    #[instrument(skip_all, fields(remote = %remote, branch = %branch))]
    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        info!(remote, branch, "pushed branch");
        Ok(())
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
