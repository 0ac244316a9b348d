//! Shared deterministic types for the repair loop.
//!
//! These types carry no I/O handles. A [`Session`] is created at run start,
//! mutated only by the repair loop, and discarded at run end.

use serde::Serialize;

/// Immutable description of the requested change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Task(String);

impl Task {
    /// Build a task from raw input, trimming surrounding whitespace.
    ///
    /// Returns `None` when nothing but whitespace remains.
    pub fn new(text: impl AsRef<str>) -> Option<Self> {
        let trimmed = text.as_ref().trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

/// Binary model of the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeState {
    Clean,
    Dirty,
}

/// Round 0 is the initial generation sub-loop, round 1 the repair sub-loop.
pub const INITIAL_ROUND: u32 = 0;

/// One generation cycle and everything observed while processing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub round: u32,
    /// 1-indexed position within the round.
    pub sequence: u32,
    pub prompt: String,
    /// Absent when the backend call itself failed.
    pub response: Option<String>,
    /// Absent when extraction failed or was never reached.
    pub diff: Option<String>,
    pub error: Option<String>,
}

impl Attempt {
    pub fn new(round: u32, sequence: u32, prompt: String) -> Self {
        Self {
            round,
            sequence,
            prompt,
            response: None,
            diff: None,
            error: None,
        }
    }
}

/// The diff that applied cleanly and passed the test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchRecord {
    pub diff: String,
    pub round: u32,
    pub sequence: u32,
}

/// Terminal result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SessionOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Per-run bookkeeping for the repair loop.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub task: Task,
    pub branch: String,
    /// Generation attempts made in the current round.
    pub generation_attempts: u32,
    /// Repair rounds entered so far.
    pub repair_attempts: u32,
    pub attempts: Vec<Attempt>,
    pub outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(task: Task, branch: impl Into<String>) -> Self {
        Self {
            task,
            branch: branch.into(),
            generation_attempts: 0,
            repair_attempts: 0,
            attempts: Vec::new(),
            outcome: None,
        }
    }

    pub fn current_round(&self) -> u32 {
        self.repair_attempts
    }

    /// Latest error recorded on any attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.last().and_then(|a| a.error.as_deref())
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Some(SessionOutcome::Succeeded)
    }
}
