//! Prompt builder for model requests.
//!
//! Templates live next to this module and are embedded at compile time. The
//! builder bounds the size of echoed test output and diffs so a noisy test run
//! cannot blow up the request.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::Task;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Bytes of a rejected diff echoed back in a corrective prompt.
pub const DIFF_ECHO_LIMIT_BYTES: usize = 2_000;

/// Context carried into the repair round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairContext {
    /// Diff that applied but failed the test suite.
    pub diff: String,
    /// Merged test harness output.
    pub test_output: String,
}

/// Why the previous attempt in this round could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    /// Sequence number of the failed attempt.
    pub attempt: u32,
    pub error: String,
    /// Extracted diff, when extraction got that far.
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RepairView<'a> {
    diff: &'a str,
    test_output: String,
}

#[derive(Debug, Clone, Serialize)]
struct CorrectionView<'a> {
    attempt: u32,
    error: &'a str,
    diff: Option<String>,
}

/// Template engine wrapper around minijinja.
#[derive(Debug, Clone)]
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self { env }
    }
}

/// Renders the per-attempt prompt within output limits.
///
/// Templates are compiled once, when the builder is created.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    engine: PromptEngine,
    output_limit_bytes: usize,
}

impl PromptBuilder {
    pub fn new(output_limit_bytes: usize) -> Self {
        Self {
            engine: PromptEngine::new(),
            output_limit_bytes,
        }
    }

    /// Fixed instructions sent as the system prompt.
    pub fn system(&self) -> &'static str {
        SYSTEM_TEMPLATE
    }

    /// Task text plus repair context and the previous attempt's failure, if any.
    pub fn build(
        &self,
        task: &Task,
        repair: Option<&RepairContext>,
        correction: Option<&Correction>,
    ) -> Result<String> {
        let template = self.engine.env.get_template("task")?;
        let repair = repair.map(|r| RepairView {
            diff: r.diff.trim_end(),
            test_output: tail_bytes(r.test_output.trim_end(), self.output_limit_bytes),
        });
        let correction = correction.map(|c| CorrectionView {
            attempt: c.attempt,
            error: c.error.trim_end(),
            diff: c
                .diff
                .as_deref()
                .map(|d| head_bytes(d.trim_end(), DIFF_ECHO_LIMIT_BYTES)),
        });
        let has_repair = repair.is_some();
        let has_correction = correction.is_some();
        let rendered = template.render(context! {
            task => task.text(),
            repair => repair,
            correction => correction,
        })?;
        debug!(
            bytes = rendered.len(),
            has_repair, has_correction, "rendered prompt"
        );
        Ok(rendered)
    }
}

/// Keep the last `limit` bytes; test failures are summarized at the end of the output.
pub fn tail_bytes(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes truncated ...]\n{}", &text[start..])
}

/// Keep the first `limit` bytes.
pub fn head_bytes(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... {} bytes truncated ...]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("add a Clamp function").expect("task")
    }

    #[test]
    fn plain_prompt_contains_only_the_task() {
        let prompt = PromptBuilder::new(1_000)
            .build(&task(), None, None)
            .expect("render");
        assert!(prompt.contains("<task>\nadd a Clamp function\n</task>"));
        assert!(!prompt.contains("TESTS FAILED"));
        assert!(!prompt.contains("previous_attempt"));
    }

    #[test]
    fn one_builder_serves_every_attempt() {
        let builder = PromptBuilder::new(1_000);
        let first = builder.build(&task(), None, None).expect("first");
        let correction = Correction {
            attempt: 1,
            error: "model backend failed: timeout".to_string(),
            diff: None,
        };
        let second = builder
            .build(&task(), None, Some(&correction))
            .expect("second");
        assert!(!first.contains("timeout"));
        assert!(second.contains("timeout"));
        assert_eq!(builder.build(&task(), None, None).expect("third"), first);
    }

    #[test]
    fn repair_prompt_includes_test_output_and_rejected_diff() {
        let repair = RepairContext {
            diff: "diff --git a/a b/a\n+x\n".to_string(),
            test_output: "Failed ClampTests.UpperBound\n".to_string(),
        };
        let prompt = PromptBuilder::new(1_000)
            .build(&task(), Some(&repair), None)
            .expect("render");
        let task_pos = prompt.find("add a Clamp function").expect("task");
        let failure_pos = prompt.find("TESTS FAILED").expect("failure");
        assert!(task_pos < failure_pos);
        assert!(prompt.contains("Failed ClampTests.UpperBound"));
        assert!(prompt.contains("diff --git a/a b/a"));
    }

    #[test]
    fn correction_prompt_includes_error_and_diff_excerpt() {
        let correction = Correction {
            attempt: 1,
            error: "git apply --check failed:\nerror: patch failed: README.md:1".to_string(),
            diff: Some("diff --git a/README.md b/README.md\n".to_string()),
        };
        let prompt = PromptBuilder::new(1_000)
            .build(&task(), None, Some(&correction))
            .expect("render");
        assert!(prompt.contains("number=\"1\""));
        assert!(prompt.contains("patch failed: README.md:1"));
        assert!(prompt.contains("The diff you sent began with"));
    }

    #[test]
    fn long_test_output_keeps_the_tail() {
        let output = format!("{}FINAL SUMMARY", "x".repeat(5_000));
        let repair = RepairContext {
            diff: "diff --git a/a b/a\n".to_string(),
            test_output: output,
        };
        let prompt = PromptBuilder::new(100)
            .build(&task(), Some(&repair), None)
            .expect("render");
        assert!(prompt.contains("FINAL SUMMARY"));
        assert!(prompt.contains("bytes truncated"));
        assert!(prompt.len() < 1_500);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "ééééé";
        assert_eq!(head_bytes(text, 3), "é\n[... 8 bytes truncated ...]");
        assert!(tail_bytes(text, 3).ends_with("é"));
    }
}
