//! Loop-level tests for the retry ceiling and the repair bound.
//!
//! These drive `RepairLoop` against a real temporary git repository with a
//! scripted model and harness.

use patch_agent::core::error::RunError;
use patch_agent::core::types::{Session, SessionOutcome, Task};
use patch_agent::core::validate::{PatchValidator, default_marker_rules};
use patch_agent::io::git::{Git, VersionControl};
use patch_agent::repair::{LoopSettings, RepairLoop};
use patch_agent::test_support::{
    PartialApplyGit, ScriptedHarness, ScriptedModel, TestRepo, harness_fail, harness_pass,
    new_file_diff,
};

fn settings(max_diff_attempts: u32) -> LoopSettings {
    LoopSettings {
        max_diff_attempts,
        temperature: 0.2,
        prompt_output_limit_bytes: 8_000,
    }
}

fn validator() -> PatchValidator {
    PatchValidator::standard(32, &default_marker_rules()).expect("validator")
}

fn session() -> Session {
    Session::new(Task::new("add a Clamp function").expect("task"), "agent/clamp")
}

#[test]
fn unparsable_responses_stop_after_exactly_max_attempts() {
    let repo = TestRepo::new().expect("repo");
    let git = Git::new(repo.path());
    let model = ScriptedModel::repeating("I'm sorry, I can't produce a patch for that.");
    let harness = ScriptedHarness::new(Vec::new());
    let validator = validator();
    let mut session = session();

    let err = RepairLoop::new(&model, &git, &harness, &validator, settings(3))
        .run(&mut session)
        .expect_err("attempts exhausted");

    match &err {
        RunError::AttemptsExhausted {
            round,
            attempts,
            last_error,
        } => {
            assert_eq!(*round, 0);
            assert_eq!(*attempts, 3);
            assert!(last_error.contains("diff --git"));
            assert!(last_error.contains("last model response:"));
            assert!(last_error.contains("I'm sorry, I can't produce a patch for that."));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(), 3);
    assert_eq!(session.attempts.len(), 3);
    assert_eq!(harness.runs(), 0);
    assert!(matches!(session.outcome, Some(SessionOutcome::Failed { .. })));
    assert!(git.status().expect("status").is_empty());
}

#[test]
fn later_prompts_carry_the_previous_error() {
    let repo = TestRepo::new().expect("repo");
    let git = Git::new(repo.path());
    let model = ScriptedModel::repeating("no patch today");
    let harness = ScriptedHarness::new(Vec::new());
    let validator = validator();
    let mut session = session();

    RepairLoop::new(&model, &git, &harness, &validator, settings(2))
        .run(&mut session)
        .expect_err("exhausted");

    let prompts = model.prompts();
    assert!(!prompts[0].contains("previous_attempt"));
    assert!(prompts[1].contains("previous_attempt"));
    assert!(prompts[1].contains("no `diff --git` block found"));
    for request in model.requests() {
        assert!((request.temperature - 0.2).abs() < f32::EPSILON);
    }
}

#[test]
fn failing_repair_ends_after_exactly_one_repair_round() {
    let repo = TestRepo::new().expect("repo");
    let git = Git::new(repo.path());
    let diff = new_file_diff(
        "core/CoreSim/MathUtil.cs",
        &["namespace CoreSim;", "public static class MathUtil { }"],
    );
    let model = ScriptedModel::repeating(diff);
    let harness = ScriptedHarness::new(vec![
        harness_fail("error CS0117: 'MathUtil' does not contain a definition for 'Clamp'"),
        harness_fail("error CS0117: still no 'Clamp'"),
    ]);
    let validator = validator();
    let mut session = session();

    let err = RepairLoop::new(&model, &git, &harness, &validator, settings(3))
        .run(&mut session)
        .expect_err("repair exhausted");

    match &err {
        RunError::RepairExhausted { test_output } => {
            assert!(test_output.contains("still no 'Clamp'"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session.repair_attempts, 1);
    assert_eq!(model.calls(), 2);
    assert_eq!(harness.runs(), 2);
    assert_eq!(session.attempts.last().map(|a| a.round), Some(1));
    assert!(err.diagnostic().contains("still no 'Clamp'"));
    assert!(git.status().expect("status").is_empty());
    assert!(!repo.path().join("core/CoreSim/MathUtil.cs").exists());
}

#[test]
fn repair_round_has_its_own_attempt_budget() {
    let repo = TestRepo::new().expect("repo");
    let git = Git::new(repo.path());
    let diff = new_file_diff("src/Clamp.cs", &["public static class Clamp { }"]);
    let model = ScriptedModel::new(vec![
        Ok(diff),
        Ok("still thinking".to_string()),
        Ok("still thinking".to_string()),
    ]);
    let harness = ScriptedHarness::new(vec![harness_fail("Failed ClampTests")]);
    let validator = validator();
    let mut session = session();

    let err = RepairLoop::new(&model, &git, &harness, &validator, settings(2))
        .run(&mut session)
        .expect_err("exhausted in repair round");

    match err {
        RunError::AttemptsExhausted { round, attempts, .. } => {
            assert_eq!(round, 1);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(model.calls(), 3);
    assert!(model.prompts()[1].contains("Failed ClampTests"));
}

#[test]
fn failed_apply_after_clean_check_is_rolled_back_and_retried() {
    let repo = TestRepo::new().expect("repo");
    let vcs = PartialApplyGit::new(
        repo.path(),
        "error: core/CoreSim/Clamp.cs: write interrupted",
    );
    let diff = new_file_diff(
        "core/CoreSim/Clamp.cs",
        &["public static class MathUtil", "{", "    public static int Clamp(int v) => v;", "}"],
    );
    let model = ScriptedModel::repeating(diff);
    let harness = ScriptedHarness::new(vec![harness_pass("Passed!")]);
    let validator = validator();
    let mut session = session();

    let err = RepairLoop::new(&model, &vcs, &harness, &validator, settings(2))
        .run(&mut session)
        .expect_err("every apply fails");

    assert_eq!(vcs.applies(), 2);
    assert_eq!(harness.runs(), 0);
    assert!(matches!(err, RunError::AttemptsExhausted { attempts: 2, .. }));
    assert!(err.diagnostic().contains("write interrupted"));
    let prompts = model.prompts();
    assert!(prompts[1].contains("git apply failed"));
    assert!(prompts[1].contains("write interrupted"));
    let first_error = session.attempts[0].error.as_deref().expect("error");
    assert!(first_error.starts_with("git apply failed"));
    assert!(vcs.status().expect("status").is_empty());
    assert!(!repo.path().join("core/CoreSim/Clamp.cs").exists());
}
