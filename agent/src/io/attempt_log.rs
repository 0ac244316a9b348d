//! Attempt log under `<git-dir>/patch-agent/runs/<run-id>/`.
//!
//! One directory per generation attempt (`<round>-<sequence>`) plus a
//! `session.json` summary. Written regardless of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;

use crate::core::types::{Attempt, Session, SessionOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta<'a> {
    pub run_id: &'a str,
    pub round: u32,
    pub sequence: u32,
    pub error_kind: Option<&'a str>,
    pub tests_passed: Option<bool>,
    pub recorded_at: String,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
    pub patch_path: PathBuf,
    pub error_path: PathBuf,
    pub test_log_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(run_dir: &Path, round: u32, sequence: u32) -> Self {
        let dir = run_dir.join(format!("{round}-{sequence}"));
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            patch_path: dir.join("patch.diff"),
            error_path: dir.join("error.txt"),
            test_log_path: dir.join("test.log"),
            dir,
        }
    }
}

/// Everything known about an attempt once it has been fully processed.
pub struct AttemptRecord<'a> {
    pub attempt: &'a Attempt,
    pub error_kind: Option<&'a str>,
    /// Pass flag and merged output, when the attempt reached the harness.
    pub test: Option<(bool, &'a str)>,
}

#[derive(Debug, Clone)]
pub struct AttemptLog {
    run_id: String,
    run_dir: PathBuf,
}

impl AttemptLog {
    /// Log rooted at `root/<run-id>`.
    pub fn new(root: &Path, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            run_dir: root.join(&run_id),
            run_id,
        }
    }

    /// `<git-dir>/patch-agent/runs`.
    pub fn default_root(git_dir: &Path) -> PathBuf {
        git_dir.join("patch-agent").join("runs")
    }

    /// Run id derived from the local start time.
    pub fn run_id_at(started: DateTime<Local>) -> String {
        started.format("%Y%m%d-%H%M%S").to_string()
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn write_attempt(&self, record: &AttemptRecord<'_>) -> Result<AttemptPaths> {
        let attempt = record.attempt;
        let paths = AttemptPaths::new(&self.run_dir, attempt.round, attempt.sequence);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        let meta = AttemptMeta {
            run_id: &self.run_id,
            round: attempt.round,
            sequence: attempt.sequence,
            error_kind: record.error_kind,
            tests_passed: record.test.map(|(passed, _)| passed),
            recorded_at: now_rfc3339(),
        };
        write_json(&paths.meta_path, &meta)?;
        write_text(&paths.prompt_path, &attempt.prompt)?;
        if let Some(response) = &attempt.response {
            write_text(&paths.response_path, response)?;
        }
        if let Some(diff) = &attempt.diff {
            write_text(&paths.patch_path, diff)?;
        }
        if let Some(error) = &attempt.error {
            write_text(&paths.error_path, error)?;
        }
        if let Some((_, output)) = record.test {
            write_text(&paths.test_log_path, output)?;
        }
        Ok(paths)
    }

    /// Write `session.json` (attempt bodies live in their own directories).
    pub fn write_session(&self, session: &Session) -> Result<PathBuf> {
        #[derive(Serialize)]
        struct SessionSummary<'a> {
            run_id: &'a str,
            task: &'a str,
            branch: &'a str,
            attempts: usize,
            repair_attempts: u32,
            outcome: &'a Option<SessionOutcome>,
            finished_at: String,
        }

        fs::create_dir_all(&self.run_dir)
            .with_context(|| format!("create run dir {}", self.run_dir.display()))?;
        let path = self.run_dir.join("session.json");
        write_json(
            &path,
            &SessionSummary {
                run_id: &self.run_id,
                task: session.task.text(),
                branch: &session.branch,
                attempts: session.attempts.len(),
                repair_attempts: session.repair_attempts,
                outcome: &session.outcome,
                finished_at: now_rfc3339(),
            },
        )?;
        Ok(path)
    }
}

fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::core::types::Task;

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AttemptLog::new(&AttemptLog::default_root(temp.path()), "run-1");
        let paths = AttemptPaths::new(log.run_dir(), 1, 2);
        assert!(
            paths
                .dir
                .ends_with(Path::new("patch-agent/runs/run-1/1-2"))
        );
        assert!(paths.patch_path.ends_with("patch.diff"));
        assert!(paths.test_log_path.ends_with("test.log"));
    }

    #[test]
    fn run_id_uses_compact_timestamp() {
        let started = Local
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("time");
        assert_eq!(AttemptLog::run_id_at(started), "20260304-050607");
    }

    #[test]
    fn writes_only_the_artifacts_that_exist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AttemptLog::new(temp.path(), "run-9");
        let mut attempt = Attempt::new(0, 1, "prompt body".to_string());
        attempt.response = Some("no diff here".to_string());
        attempt.error = Some("no `diff --git` block found in model output".to_string());

        let paths = log
            .write_attempt(&AttemptRecord {
                attempt: &attempt,
                error_kind: Some("extraction"),
                test: None,
            })
            .expect("write");

        assert!(paths.meta_path.is_file());
        assert!(paths.prompt_path.is_file());
        assert!(paths.response_path.is_file());
        assert!(paths.error_path.is_file());
        assert!(!paths.patch_path.exists());
        assert!(!paths.test_log_path.exists());
        let meta = fs::read_to_string(&paths.meta_path).expect("meta");
        assert!(meta.contains("\"error_kind\": \"extraction\""));
    }

    #[test]
    fn writes_session_summary() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AttemptLog::new(temp.path(), "run-3");
        let mut session = Session::new(Task::new("add a Clamp function").expect("task"), "agent/x");
        session.outcome = Some(SessionOutcome::Succeeded);
        let path = log.write_session(&session).expect("write");
        let body = fs::read_to_string(path).expect("read");
        assert!(body.contains("\"status\": \"succeeded\""));
        assert!(body.contains("add a Clamp function"));
    }
}
