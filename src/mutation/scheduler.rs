//! Sequential mutant scheduling and outcome classification.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{EndpointKey, Mutant, MutantId};
use crate::intercept::{AlreadyArmedError, ArmReport, InterceptionContext};
use crate::operators::OperatorKind;

use super::engine::{SuiteOutcome, TestInvocationError, TestRunner};

/// Why a mutant ended up errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCause {
    /// The transformation could not be applied to a matching call.
    MutantApplication,
    /// The suite exceeded its timeout.
    Timeout,
    /// The suite could not be run (spawn failure, crash, runner panic).
    TestInvocation,
}

impl ErrorCause {
    /// Stable name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCause::MutantApplication => "mutant-application",
            ErrorCause::Timeout => "timeout",
            ErrorCause::TestInvocation => "test-invocation",
        }
    }
}

/// Classification of one mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The suite failed with the mutant armed.
    Killed,
    /// The suite passed with the mutant armed.
    Survived,
    /// No verdict could be reached.
    Errored {
        /// What went wrong.
        cause: ErrorCause,
    },
}

impl Outcome {
    /// Errored with `cause`.
    pub fn errored(cause: ErrorCause) -> Self {
        Outcome::Errored { cause }
    }

    /// Stable name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Killed => "killed",
            Outcome::Survived => "survived",
            Outcome::Errored { .. } => "errored",
        }
    }
}

/// Result for one mutant, produced once per mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    /// Mutant id.
    pub mutant_id: MutantId,
    /// Mutant label at the time of the run.
    pub label: String,
    /// Targeted endpoint.
    pub endpoint: EndpointKey,
    /// Operator kind.
    pub operator: OperatorKind,
    /// Classification.
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Failing tests, error text or a note such as "matched no calls".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    /// Calls that matched the mutant's endpoint.
    #[serde(default)]
    pub matched_calls: usize,
    /// Transformations applied.
    #[serde(default)]
    pub applied: usize,
    /// Wall-clock time of the suite run.
    #[serde(default)]
    pub duration_ms: u64,
}

impl MutationResult {
    /// Result for `mutant` with no call statistics.
    pub fn new(mutant: &Mutant, outcome: Outcome) -> Self {
        Self {
            mutant_id: mutant.id,
            label: mutant.label(),
            endpoint: mutant.endpoint.clone(),
            operator: mutant.kind(),
            outcome,
            diagnostic: None,
            matched_calls: 0,
            applied: 0,
            duration_ms: 0,
        }
    }

    /// Attach a diagnostic.
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// Errors that stop a scheduling loop. Per-mutant failures never do.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Another mutant was already armed on the context.
    #[error(transparent)]
    AlreadyArmed(#[from] AlreadyArmedError),
    /// The unarmed suite failed, so no mutant can be judged.
    #[error("baseline test run failed: {}", .failures.join("; "))]
    BaselineFailed {
        /// Failures reported by the suite.
        failures: Vec<String>,
    },
    /// The unarmed suite could not be run.
    #[error("baseline test run could not be executed: {0}")]
    BaselineInvocation(TestInvocationError),
    /// An observer (for example the run log) failed.
    #[error("run observer failed: {0}")]
    Observer(String),
}

/// Hooks invoked around every mutant evaluation.
pub trait RunObserver {
    /// Called right before the mutant is armed.
    fn mutant_started(
        &mut self,
        _position: usize,
        _total: usize,
        _mutant: &Mutant,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    /// Called after the mutant is disarmed, with the suite's captured output.
    fn mutant_finished(
        &mut self,
        _mutant: &Mutant,
        _result: &MutationResult,
        _log: &str,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }
}

impl RunObserver for () {}

/// What a scheduling loop produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScheduleResult {
    /// Results in evaluation order.
    pub results: Vec<MutationResult>,
    /// Whether the loop stopped early on an interrupt.
    pub interrupted: bool,
}

/// Drives mutants through the test suite strictly one at a time.
///
/// Each cycle arms one mutant on the shared context, runs the entire suite,
/// classifies the verdict and disarms. Cycles never overlap and there is no
/// cross-mutant parallelism: every suite run observes exactly one mutant, at
/// the cost of one full suite run per mutant.
#[derive(Debug, Clone)]
pub struct Scheduler {
    context: InterceptionContext,
    interrupt: Arc<AtomicBool>,
    baseline: bool,
}

impl Scheduler {
    /// Scheduler arming mutants on `context`, with the baseline run enabled.
    pub fn new(context: InterceptionContext) -> Self {
        Self {
            context,
            interrupt: Arc::new(AtomicBool::new(false)),
            baseline: true,
        }
    }

    /// Enable or disable the unarmed baseline run.
    pub fn with_baseline(mut self, baseline: bool) -> Self {
        self.baseline = baseline;
        self
    }

    /// Share an externally owned interrupt flag.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    /// Flag that stops the loop before the next mutant when raised.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// The context mutants are armed on.
    pub fn context(&self) -> &InterceptionContext {
        &self.context
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Evaluate `mutants` in order.
    pub fn run(
        &self,
        mutants: &[Mutant],
        runner: &dyn TestRunner,
    ) -> Result<ScheduleResult, SchedulerError> {
        self.run_observed(mutants, runner, &mut ())
    }

    /// Evaluate `mutants` in order, reporting progress to `observer`.
    pub fn run_observed(
        &self,
        mutants: &[Mutant],
        runner: &dyn TestRunner,
        observer: &mut dyn RunObserver,
    ) -> Result<ScheduleResult, SchedulerError> {
        let mut outcome = ScheduleResult::default();
        if mutants.is_empty() {
            return Ok(outcome);
        }

        if self.baseline {
            info!("running baseline suite without mutants");
            match invoke(runner, &self.context) {
                Ok(Ok(suite)) if suite.all_passed => {}
                Ok(Ok(suite)) => {
                    return Err(SchedulerError::BaselineFailed {
                        failures: suite.failures,
                    });
                }
                Ok(Err(TestInvocationError::Interrupted)) => {
                    outcome.interrupted = true;
                    return Ok(outcome);
                }
                Ok(Err(err)) => return Err(SchedulerError::BaselineInvocation(err)),
                Err(message) => {
                    return Err(SchedulerError::BaselineInvocation(TestInvocationError::Other(
                        message,
                    )));
                }
            }
        }

        let total = mutants.len();
        for (index, mutant) in mutants.iter().enumerate() {
            if self.interrupted() {
                outcome.interrupted = true;
                break;
            }
            let position = index + 1;
            info!("running mutant {position}/{total}: {}", mutant.label());
            observer.mutant_started(position, total, mutant)?;

            let Some((result, log)) = self.evaluate(mutant, runner)? else {
                outcome.interrupted = true;
                break;
            };
            if let Outcome::Errored { cause } = result.outcome {
                warn!(
                    mutant = %mutant.id,
                    cause = cause.as_str(),
                    diagnostic = result.diagnostic.as_deref().unwrap_or(""),
                    "mutant errored"
                );
            }
            observer.mutant_finished(mutant, &result, &log)?;
            outcome.results.push(result);
        }

        Ok(outcome)
    }

    /// One arm/run/disarm cycle. `None` when the runner was interrupted.
    fn evaluate(
        &self,
        mutant: &Mutant,
        runner: &dyn TestRunner,
    ) -> Result<Option<(MutationResult, String)>, SchedulerError> {
        let started = Instant::now();
        let guard = self.context.arm_scoped(mutant.clone())?;
        let invocation = invoke(runner, &self.context);
        let mut report = guard.release();
        if let Ok(Ok(suite)) = &invocation {
            if let Some(traffic) = &suite.traffic {
                report.absorb(traffic);
            }
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        let (result, log) = match classify(mutant, invocation, &report) {
            Some(classified) => classified,
            None => return Ok(None),
        };
        let result = MutationResult {
            matched_calls: report.matched_calls,
            applied: report.applied,
            duration_ms,
            ..result
        };
        Ok(Some((result, log)))
    }
}

/// Run the suite, turning a runner panic into an error message.
fn invoke(
    runner: &dyn TestRunner,
    context: &InterceptionContext,
) -> Result<Result<SuiteOutcome, TestInvocationError>, String> {
    panic::catch_unwind(AssertUnwindSafe(|| runner.run_suite(context))).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        format!("test runner panicked: {message}")
    })
}

fn classify(
    mutant: &Mutant,
    invocation: Result<Result<SuiteOutcome, TestInvocationError>, String>,
    report: &ArmReport,
) -> Option<(MutationResult, String)> {
    let suite = match invocation {
        Err(panic_message) => {
            let result = MutationResult::new(mutant, Outcome::errored(ErrorCause::TestInvocation))
                .with_diagnostic(panic_message);
            return Some((result, String::new()));
        }
        Ok(Err(TestInvocationError::Interrupted)) => return None,
        Ok(Err(err)) => {
            let cause = match err {
                TestInvocationError::TimedOut(_) => ErrorCause::Timeout,
                _ => ErrorCause::TestInvocation,
            };
            let result =
                MutationResult::new(mutant, Outcome::errored(cause)).with_diagnostic(err.to_string());
            return Some((result, String::new()));
        }
        Ok(Ok(suite)) => suite,
    };

    let result = if !report.failures.is_empty() {
        let messages: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
        MutationResult::new(mutant, Outcome::errored(ErrorCause::MutantApplication))
            .with_diagnostic(messages.join("; "))
    } else if !suite.all_passed {
        let result = MutationResult::new(mutant, Outcome::Killed);
        if suite.failures.is_empty() {
            result
        } else {
            result.with_diagnostic(suite.failures.join("; "))
        }
    } else if report.matched_calls == 0 {
        MutationResult::new(mutant, Outcome::Survived).with_diagnostic("mutant matched no calls")
    } else if report.applied == 0 {
        MutationResult::new(mutant, Outcome::Survived)
            .with_diagnostic("mutant matched calls but never applied")
    } else {
        MutationResult::new(mutant, Outcome::Survived)
    };
    Some((result, suite.log))
}
