//! Test helpers: temporary repositories and scripted collaborators.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::io::config::MergeMethod;
use crate::io::git::{Git, PatchApplication, StatusEntry, VersionControl};
use crate::io::harness::{HarnessOutput, TestHarness};
use crate::io::hosting::{CodeHost, PullRequest, PullRequestRequest};
use crate::io::model::{GenerateRequest, ModelBackend};

/// A git repository in a temp dir with one commit on `main` and a bare `origin`.
pub struct TestRepo {
    _temp: TempDir,
    work: PathBuf,
    origin: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let work = temp.path().join("work");
        let origin = temp.path().join("origin.git");
        std::fs::create_dir_all(&work).context("create work dir")?;

        git(temp.path(), &["init", "--bare", "--quiet", path_str(&origin)?])?;
        git(&work, &["init", "--quiet", "-b", "main"])?;
        git(&work, &["config", "user.name", "Patch Agent Tests"])?;
        git(&work, &["config", "user.email", "tests@example.invalid"])?;
        git(&work, &["config", "commit.gpgsign", "false"])?;
        std::fs::write(work.join("README.md"), "hi\n").context("write README")?;
        git(&work, &["add", "-A"])?;
        git(&work, &["commit", "--quiet", "-m", "init"])?;
        git(&work, &["remote", "add", "origin", path_str(&origin)?])?;
        git(&work, &["push", "--quiet", "-u", "origin", "main"])?;

        Ok(Self {
            _temp: temp,
            work,
            origin,
        })
    }

    /// Working copy root.
    pub fn path(&self) -> &Path {
        &self.work
    }

    pub fn remote_has_branch(&self, branch: &str) -> Result<bool> {
        let out = git(&self.origin, &["branch", "--list", branch])?;
        Ok(!out.trim().is_empty())
    }

    /// Number of commits reachable from `rev` in the working copy.
    pub fn commit_count(&self, rev: &str) -> Result<u32> {
        let out = git(&self.work, &["rev-list", "--count", rev])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse commit count '{}'", out.trim()))
    }

    pub fn head_message(&self) -> Result<String> {
        Ok(git(&self.work, &["log", "-1", "--format=%s"])?.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(git(&self.work, &["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .to_string())
    }

    /// Paths touched by the HEAD commit.
    pub fn head_files(&self) -> Result<Vec<String>> {
        let out = git(&self.work, &["show", "--name-only", "--format=", "HEAD"])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// Write `path` and commit it on the current branch.
    pub fn commit_file(&self, path: &str, contents: &str, message: &str) -> Result<()> {
        let full = self.work.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).context("create parent dir")?;
        }
        std::fs::write(&full, contents).with_context(|| format!("write {path}"))?;
        git(&self.work, &["add", "--", path])?;
        git(&self.work, &["commit", "--quiet", "-m", message])?;
        Ok(())
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// Unified diff creating `path` with the given lines.
pub fn new_file_diff(path: &str, lines: &[&str]) -> String {
    let mut diff = format!(
        "diff --git a/{path} b/{path}\nnew file mode 100644\n--- /dev/null\n+++ b/{path}\n@@ -0,0 +1,{} @@\n",
        lines.len()
    );
    for line in lines {
        diff.push('+');
        diff.push_str(line);
        diff.push('\n');
    }
    diff
}

/// Real git, except that `apply` writes the patch and then reports a failure.
///
/// Models a tool that passes `--check` but fails part-way through the real
/// apply, leaving the tree dirty.
pub struct PartialApplyGit {
    inner: Git,
    detail: String,
    applies: Cell<usize>,
}

impl PartialApplyGit {
    pub fn new(workdir: &Path, detail: &str) -> Self {
        Self {
            inner: Git::new(workdir),
            detail: detail.to_string(),
            applies: Cell::new(0),
        }
    }

    pub fn applies(&self) -> usize {
        self.applies.get()
    }
}

impl VersionControl for PartialApplyGit {
    fn status(&self) -> Result<Vec<StatusEntry>> {
        self.inner.status()
    }

    fn create_or_reset_branch(&self, name: &str) -> Result<()> {
        self.inner.create_or_reset_branch(name)
    }

    fn dry_run_apply(&self, diff: &str) -> Result<PatchApplication> {
        self.inner.dry_run_apply(diff)
    }

    fn apply(&self, diff: &str) -> Result<PatchApplication> {
        self.applies.set(self.applies.get() + 1);
        self.inner.apply(diff)?;
        Ok(PatchApplication::Conflict {
            detail: self.detail.clone(),
        })
    }

    fn discard_all_changes(&self) -> Result<()> {
        self.inner.discard_all_changes()
    }

    fn stage_and_commit(&self, message: &str) -> Result<bool> {
        self.inner.stage_and_commit(message)
    }

    fn push(&self, remote: &str, branch: &str) -> Result<()> {
        self.inner.push(remote, branch)
    }
}

/// Model backend that replays queued responses and records every request.
pub struct ScriptedModel {
    queue: RefCell<VecDeque<Result<String, String>>>,
    fallback: Option<String>,
    requests: RefCell<Vec<GenerateRequest>>,
}

impl ScriptedModel {
    /// `Err` entries simulate backend failures.
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            queue: RefCell::new(responses.into()),
            fallback: None,
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Return `text` for every request.
    pub fn repeating(text: impl Into<String>) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            fallback: Some(text.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.borrow().clone()
    }
}

impl ModelBackend for ScriptedModel {
    fn generate(&self, request: &GenerateRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("scripted model exhausted")),
        }
    }
}

/// Harness that replays queued results. `Err` simulates a harness that cannot start.
pub struct ScriptedHarness {
    queue: RefCell<VecDeque<Result<HarnessOutput, String>>>,
    runs: Cell<usize>,
}

impl ScriptedHarness {
    pub fn new(results: Vec<Result<HarnessOutput, String>>) -> Self {
        Self {
            queue: RefCell::new(results.into()),
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.get()
    }
}

impl TestHarness for ScriptedHarness {
    fn execute(&self) -> Result<HarnessOutput> {
        self.runs.set(self.runs.get() + 1);
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted harness exhausted")),
        }
    }
}

pub fn harness_pass(output: &str) -> Result<HarnessOutput, String> {
    Ok(HarnessOutput {
        exit_code: Some(0),
        output: output.to_string(),
    })
}

pub fn harness_fail(output: &str) -> Result<HarnessOutput, String> {
    Ok(HarnessOutput {
        exit_code: Some(1),
        output: output.to_string(),
    })
}

/// Code host that records calls and can be told to fail.
#[derive(Default)]
pub struct RecordingHost {
    fail_pull_request: Option<String>,
    fail_auto_merge: Option<String>,
    opened: RefCell<Vec<PullRequestRequest>>,
    auto_merges: RefCell<Vec<(u64, MergeMethod)>>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_pull_request(message: &str) -> Self {
        Self {
            fail_pull_request: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_auto_merge(message: &str) -> Self {
        Self {
            fail_auto_merge: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> Vec<PullRequestRequest> {
        self.opened.borrow().clone()
    }

    pub fn auto_merges(&self) -> Vec<(u64, MergeMethod)> {
        self.auto_merges.borrow().clone()
    }
}

impl CodeHost for RecordingHost {
    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<PullRequest> {
        if let Some(message) = &self.fail_pull_request {
            return Err(anyhow!(message.clone()));
        }
        let mut opened = self.opened.borrow_mut();
        opened.push(request.clone());
        let number = opened.len() as u64;
        Ok(PullRequest {
            number,
            url: format!("https://github.test/acme/sim/pull/{number}"),
            node_id: format!("PR_node{number}"),
        })
    }

    fn enable_auto_merge(&self, pr: &PullRequest, method: MergeMethod) -> Result<()> {
        if let Some(message) = &self.fail_auto_merge {
            return Err(anyhow!(message.clone()));
        }
        self.auto_merges.borrow_mut().push((pr.number, method));
        Ok(())
    }
}
