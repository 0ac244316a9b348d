//! Worktree controller: the only mutator of the working copy during a run.
//!
//! At most one diff is applied-but-unverified at a time; every failure path
//! goes through [`Worktree::rollback`] before the next mutation.

use tracing::{debug, info, instrument, warn};

use crate::core::error::{AttemptError, RunError};
use crate::core::types::WorktreeState;
use crate::io::git::{PatchApplication, StatusEntry, VersionControl};

pub struct Worktree<'a, V: VersionControl + ?Sized> {
    vcs: &'a V,
    state: WorktreeState,
}

impl<'a, V: VersionControl + ?Sized> Worktree<'a, V> {
    /// Wrap `vcs`, assuming a clean tree until told otherwise.
    pub fn new(vcs: &'a V) -> Self {
        Self {
            vcs,
            state: WorktreeState::Clean,
        }
    }

    pub fn state(&self) -> WorktreeState {
        self.state
    }

    /// Fail with [`RunError::DirtyWorktree`] if anything is uncommitted, untracked files included.
    #[instrument(skip_all)]
    pub fn assert_clean(&mut self) -> Result<(), RunError> {
        let entries = self.vcs.status().map_err(RunError::Vcs)?;
        if entries.is_empty() {
            self.state = WorktreeState::Clean;
            return Ok(());
        }
        self.state = WorktreeState::Dirty;
        warn!(count = entries.len(), "working tree is dirty");
        Err(RunError::DirtyWorktree {
            paths: describe(&entries),
        })
    }

    /// Dry-run the diff. The tree is not touched.
    pub fn check_apply(&self, diff: &str) -> Result<Result<(), AttemptError>, RunError> {
        match self.vcs.dry_run_apply(diff).map_err(RunError::Vcs)? {
            PatchApplication::Clean => Ok(Ok(())),
            PatchApplication::Conflict { detail } => Ok(Err(AttemptError::ApplyCheck { detail })),
        }
    }

    /// Apply the diff. The state is DIRTY from here on, even if the tool rejects it.
    #[instrument(skip_all, fields(diff_bytes = diff.len()))]
    pub fn apply(&mut self, diff: &str) -> Result<Result<(), AttemptError>, RunError> {
        self.state = WorktreeState::Dirty;
        match self.vcs.apply(diff).map_err(RunError::Vcs)? {
            PatchApplication::Clean => {
                info!("patch applied");
                Ok(Ok(()))
            }
            PatchApplication::Conflict { detail } => Ok(Err(AttemptError::Apply { detail })),
        }
    }

    /// Discard every uncommitted change and re-assert cleanliness.
    ///
    /// Safe to call on a clean tree. A tree that is still dirty afterwards is a
    /// version-control failure.
    #[instrument(skip_all)]
    pub fn rollback(&mut self) -> Result<(), RunError> {
        self.vcs.discard_all_changes().map_err(RunError::Vcs)?;
        let remaining = self.vcs.status().map_err(RunError::Vcs)?;
        if !remaining.is_empty() {
            self.state = WorktreeState::Dirty;
            return Err(RunError::Vcs(anyhow::anyhow!(
                "rollback left uncommitted changes:\n{}",
                describe(&remaining)
            )));
        }
        self.state = WorktreeState::Clean;
        debug!("worktree rolled back to clean");
        Ok(())
    }
}

fn describe(entries: &[StatusEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{} {}", e.code, e.path))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::io::git::Git;
    use crate::test_support::{PartialApplyGit, TestRepo, new_file_diff};

    #[test]
    fn dirty_tree_lists_untracked_paths() {
        let repo = TestRepo::new().expect("repo");
        fs::write(repo.path().join("scratch.txt"), "x\n").expect("write");
        let git = Git::new(repo.path());
        let mut worktree = Worktree::new(&git);

        match worktree.assert_clean() {
            Err(RunError::DirtyWorktree { paths }) => assert!(paths.contains("scratch.txt")),
            other => panic!("expected dirty worktree, got {other:?}"),
        }
        assert_eq!(worktree.state(), WorktreeState::Dirty);
    }

    #[test]
    fn rollback_twice_stays_clean() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let mut worktree = Worktree::new(&git);
        worktree.assert_clean().expect("clean");

        let diff = new_file_diff("src/Clamp.cs", &["public static class Clamp {}"]);
        worktree.check_apply(&diff).expect("vcs").expect("check");
        worktree.apply(&diff).expect("vcs").expect("apply");
        assert_eq!(worktree.state(), WorktreeState::Dirty);
        assert!(repo.path().join("src/Clamp.cs").is_file());

        worktree.rollback().expect("first rollback");
        assert_eq!(worktree.state(), WorktreeState::Clean);
        assert!(!repo.path().join("src/Clamp.cs").exists());

        worktree.rollback().expect("second rollback");
        assert_eq!(worktree.state(), WorktreeState::Clean);
        worktree.assert_clean().expect("still clean");
    }

    #[test]
    fn failed_dry_run_is_an_attempt_error_and_keeps_tree_clean() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let worktree = Worktree::new(&git);
        let diff = "diff --git a/missing.txt b/missing.txt\n--- a/missing.txt\n+++ b/missing.txt\n@@ -1 +1 @@\n-old\n+new\n";

        let err = worktree
            .check_apply(diff)
            .expect("vcs")
            .expect_err("conflict");
        assert_eq!(err.kind(), "apply_check");
        assert!(err.to_string().contains("missing.txt"));
        assert_eq!(worktree.state(), WorktreeState::Clean);
    }

    #[test]
    fn failed_apply_leaves_tree_dirty_until_rollback() {
        let repo = TestRepo::new().expect("repo");
        let vcs = PartialApplyGit::new(repo.path(), "error: write interrupted");
        let mut worktree = Worktree::new(&vcs);
        let diff = new_file_diff("src/Clamp.cs", &["public static class Clamp {}"]);

        worktree.check_apply(&diff).expect("vcs").expect("check");
        let err = worktree.apply(&diff).expect("vcs").expect_err("apply fails");
        assert_eq!(err.kind(), "apply");
        assert_eq!(worktree.state(), WorktreeState::Dirty);
        assert!(repo.path().join("src/Clamp.cs").is_file());

        worktree.rollback().expect("rollback");
        assert_eq!(worktree.state(), WorktreeState::Clean);
        assert!(!repo.path().join("src/Clamp.cs").exists());
    }
}
