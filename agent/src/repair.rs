//! Repair loop controller.
//!
//! Drives generation attempts through extraction, validation, apply and test,
//! and decides between retry, one repair round, success and failure:
//!
//! ```text
//! START -> GENERATING -> VALIDATING -> APPLYING -> TESTING -> SUCCEEDED
//!              ^              |            |          |
//!              +--------------+------------+          +-> REPAIRING -> GENERATING
//!                  (rollback, error folded into prompt)   +-> FAILED
//! ```
//!
//! Every failure path rolls the worktree back before the next mutation, and
//! the worktree is clean whenever the loop reports `FAILED`.

use tracing::{debug, info, instrument, warn};

use crate::core::error::{AttemptError, RunError};
use crate::core::extract::extract_diff;
use crate::core::types::{Attempt, PatchRecord, Session, SessionOutcome};
use crate::core::validate::PatchValidator;
use crate::io::attempt_log::{AttemptLog, AttemptRecord};
use crate::io::config::AgentConfig;
use crate::io::git::VersionControl;
use crate::io::harness::{TestHarness, run_tests};
use crate::io::model::{GenerateRequest, ModelBackend};
use crate::io::prompt::{Correction, PromptBuilder, RepairContext, head_bytes};
use crate::worktree::Worktree;

/// Repair rounds allowed after the first test failure.
pub const MAX_REPAIR_ROUNDS: u32 = 1;

/// Bytes of raw model output quoted when a round ends without a usable diff.
const RESPONSE_EXCERPT_BYTES: usize = 1_000;

/// Loop tunables taken from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub max_diff_attempts: u32,
    pub temperature: f32,
    pub prompt_output_limit_bytes: usize,
}

impl LoopSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_diff_attempts: config.max_diff_attempts,
            temperature: config.temperature,
            prompt_output_limit_bytes: config.prompt_output_limit_bytes,
        }
    }
}

/// States of the repair loop. Attempt-carrying states own the in-flight attempt.
#[derive(Debug)]
enum LoopState {
    Start,
    Generating,
    Validating(Attempt),
    Applying { attempt: Attempt, diff: String },
    Testing { attempt: Attempt, diff: String },
    Repairing { diff: String, test_output: String },
    Succeeded(PatchRecord),
    Failed(RunError),
}

impl LoopState {
    fn name(&self) -> &'static str {
        match self {
            LoopState::Start => "start",
            LoopState::Generating => "generating",
            LoopState::Validating(_) => "validating",
            LoopState::Applying { .. } => "applying",
            LoopState::Testing { .. } => "testing",
            LoopState::Repairing { .. } => "repairing",
            LoopState::Succeeded(_) => "succeeded",
            LoopState::Failed(_) => "failed",
        }
    }
}

pub struct RepairLoop<'a, M, V, H>
where
    M: ModelBackend + ?Sized,
    V: VersionControl + ?Sized,
    H: TestHarness + ?Sized,
{
    model: &'a M,
    harness: &'a H,
    validator: &'a PatchValidator,
    worktree: Worktree<'a, V>,
    prompts: PromptBuilder,
    settings: LoopSettings,
    log: Option<&'a AttemptLog>,
    repair: Option<RepairContext>,
    correction: Option<Correction>,
}

impl<'a, M, V, H> RepairLoop<'a, M, V, H>
where
    M: ModelBackend + ?Sized,
    V: VersionControl + ?Sized,
    H: TestHarness + ?Sized,
{
    pub fn new(
        model: &'a M,
        vcs: &'a V,
        harness: &'a H,
        validator: &'a PatchValidator,
        settings: LoopSettings,
    ) -> Self {
        Self {
            model,
            harness,
            validator,
            worktree: Worktree::new(vcs),
            prompts: PromptBuilder::new(settings.prompt_output_limit_bytes),
            settings,
            log: None,
            repair: None,
            correction: None,
        }
    }

    pub fn with_attempt_log(mut self, log: &'a AttemptLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Run to a terminal state, recording attempts and the outcome on `session`.
    ///
    /// On success the verified patch is left applied (uncommitted) on the worktree.
    #[instrument(skip_all, fields(branch = %session.branch))]
    pub fn run(mut self, session: &mut Session) -> Result<PatchRecord, RunError> {
        let mut state = LoopState::Start;
        loop {
            debug!(state = state.name(), "repair loop state");
            state = match state {
                LoopState::Start => match self.worktree.assert_clean() {
                    Ok(()) => LoopState::Generating,
                    // Never roll back someone else's uncommitted work.
                    Err(err) => return Err(self.finish_failed(session, err)),
                },
                LoopState::Generating => self.generate(session).unwrap_or_else(LoopState::Failed),
                LoopState::Validating(attempt) => self
                    .validate(session, attempt)
                    .unwrap_or_else(LoopState::Failed),
                LoopState::Applying { attempt, diff } => self
                    .apply(session, attempt, diff)
                    .unwrap_or_else(LoopState::Failed),
                LoopState::Testing { attempt, diff } => self.test(session, attempt, diff),
                LoopState::Repairing { diff, test_output } => self
                    .enter_repair(session, diff, test_output)
                    .unwrap_or_else(LoopState::Failed),
                LoopState::Succeeded(record) => {
                    info!(
                        round = record.round,
                        sequence = record.sequence,
                        "patch verified"
                    );
                    session.outcome = Some(SessionOutcome::Succeeded);
                    self.write_session(session);
                    return Ok(record);
                }
                LoopState::Failed(err) => {
                    let err = match self.worktree.rollback() {
                        Ok(()) => err,
                        Err(rollback_err) => {
                            warn!(original = %err, "rollback failed while reporting failure");
                            rollback_err
                        }
                    };
                    return Err(self.finish_failed(session, err));
                }
            };
        }
    }

    fn generate(&mut self, session: &mut Session) -> Result<LoopState, RunError> {
        if session.generation_attempts >= self.settings.max_diff_attempts {
            return Ok(LoopState::Failed(RunError::AttemptsExhausted {
                round: session.current_round(),
                attempts: session.generation_attempts,
                last_error: exhaustion_detail(session),
            }));
        }
        session.generation_attempts += 1;
        let prompt = self
            .prompts
            .build(&session.task, self.repair.as_ref(), self.correction.as_ref())
            .map_err(RunError::Prompt)?;
        let mut attempt = Attempt::new(session.current_round(), session.generation_attempts, prompt);
        info!(
            round = attempt.round,
            sequence = attempt.sequence,
            max = self.settings.max_diff_attempts,
            "generation attempt"
        );

        let request = GenerateRequest {
            prompt: attempt.prompt.clone(),
            system: self.prompts.system().to_string(),
            temperature: self.settings.temperature,
        };
        match self.model.generate(&request) {
            Ok(response) => {
                attempt.response = Some(response);
                Ok(LoopState::Validating(attempt))
            }
            Err(err) => self.retry(
                session,
                attempt,
                AttemptError::Backend(format!("{err:#}")),
            ),
        }
    }

    fn validate(&mut self, session: &mut Session, mut attempt: Attempt) -> Result<LoopState, RunError> {
        let response = attempt.response.as_deref().unwrap_or_default();
        let diff = match extract_diff(response) {
            Ok(diff) => diff,
            Err(err) => return self.retry(session, attempt, err.into()),
        };
        attempt.diff = Some(diff.clone());
        if let Err(err) = self.validator.validate(&diff) {
            return self.retry(session, attempt, err.into());
        }
        Ok(LoopState::Applying { attempt, diff })
    }

    fn apply(
        &mut self,
        session: &mut Session,
        attempt: Attempt,
        diff: String,
    ) -> Result<LoopState, RunError> {
        if let Err(err) = self.worktree.check_apply(&diff)? {
            return self.retry(session, attempt, err);
        }
        if let Err(err) = self.worktree.apply(&diff)? {
            return self.retry(session, attempt, err);
        }
        Ok(LoopState::Testing { attempt, diff })
    }

    fn test(&mut self, session: &mut Session, mut attempt: Attempt, diff: String) -> LoopState {
        let report = match run_tests(self.harness) {
            Ok(report) => report,
            Err(detail) => {
                attempt.error = Some(format!("test harness could not be started: {detail}"));
                self.record(session, attempt, Some("harness_start"), None);
                return LoopState::Failed(RunError::HarnessStart(detail));
            }
        };

        let (round, sequence) = (attempt.round, attempt.sequence);
        if report.passed {
            self.record(session, attempt, None, Some((true, &report.output)));
            return LoopState::Succeeded(PatchRecord {
                diff,
                round,
                sequence,
            });
        }

        attempt.error = Some("test suite failed".to_string());
        self.record(session, attempt, Some("tests"), Some((false, &report.output)));
        if session.repair_attempts < MAX_REPAIR_ROUNDS {
            LoopState::Repairing {
                diff,
                test_output: report.output,
            }
        } else {
            LoopState::Failed(RunError::RepairExhausted {
                test_output: report.output,
            })
        }
    }

    fn enter_repair(
        &mut self,
        session: &mut Session,
        diff: String,
        test_output: String,
    ) -> Result<LoopState, RunError> {
        self.worktree.rollback()?;
        session.repair_attempts += 1;
        session.generation_attempts = 0;
        self.correction = None;
        self.repair = Some(RepairContext { diff, test_output });
        info!(round = session.current_round(), "entering repair round");
        Ok(LoopState::Generating)
    }

    /// Record a retryable failure, fold it into the next prompt, and roll back.
    fn retry(
        &mut self,
        session: &mut Session,
        mut attempt: Attempt,
        err: AttemptError,
    ) -> Result<LoopState, RunError> {
        let message = err.to_string();
        warn!(
            round = attempt.round,
            sequence = attempt.sequence,
            kind = err.kind(),
            "attempt rejected"
        );
        self.correction = Some(Correction {
            attempt: attempt.sequence,
            error: message.clone(),
            diff: attempt.diff.clone(),
        });
        attempt.error = Some(message);
        self.record(session, attempt, Some(err.kind()), None);
        self.worktree.rollback()?;
        Ok(LoopState::Generating)
    }

    fn record(
        &self,
        session: &mut Session,
        attempt: Attempt,
        error_kind: Option<&str>,
        test: Option<(bool, &str)>,
    ) {
        if let Some(log) = self.log {
            let written = log.write_attempt(&AttemptRecord {
                attempt: &attempt,
                error_kind,
                test,
            });
            if let Err(err) = written {
                warn!(err = %format!("{err:#}"), "failed to write attempt log");
            }
        }
        session.attempts.push(attempt);
    }

    fn finish_failed(&self, session: &mut Session, err: RunError) -> RunError {
        warn!(error = %err, "repair loop failed");
        session.outcome = Some(SessionOutcome::Failed {
            reason: err.to_string(),
        });
        self.write_session(session);
        err
    }

    fn write_session(&self, session: &Session) {
        if let Some(log) = self.log {
            if let Err(err) = log.write_session(session) {
                warn!(err = %format!("{err:#}"), "failed to write session log");
            }
        }
    }
}

/// Last recorded error, followed by the head of the raw model output when
/// nothing could be extracted from it.
fn exhaustion_detail(session: &Session) -> String {
    let error = session
        .last_error()
        .unwrap_or("no attempt recorded an error")
        .to_string();
    match session.attempts.last() {
        Some(Attempt {
            diff: None,
            response: Some(response),
            ..
        }) => format!(
            "{error}\nlast model response:\n{}",
            head_bytes(response.trim(), RESPONSE_EXCERPT_BYTES)
        ),
        _ => error,
    }
}
