//! Mutation run orchestration (new run, resume, status, report).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::info;

use crate::catalog::{Mutant, enumerate_all};
use crate::intercept::InterceptionContext;
use crate::schema::{SchemaParseError, load_path};

use super::config::{ConfigError, MutationConfig};
use super::engine::TestRunner;
use super::events::{MutationEvent, RunConfigSnapshot, now_timestamp_ms};
use super::report::{ReportFormat, render_report};
use super::scheduler::{MutationResult, Outcome, RunObserver, Scheduler, SchedulerError};
use super::state::{MutationStateError, RunSnapshot, append_event, replay_events};

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Run orchestration errors.
#[derive(Debug, Error)]
pub enum MutationRunError {
    /// State layer error.
    #[error("state error: {0}")]
    State(#[from] MutationStateError),
    /// Schema could not be loaded.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaParseError),
    /// The scheduling loop stopped.
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Signal handler error.
    #[error("signal handler installation failed: {0}")]
    Signal(String),
}

/// Result returned by run/resume operations.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Run id.
    pub run_id: String,
    /// Path to run directory.
    pub run_dir: PathBuf,
    /// Materialized snapshot after operation.
    pub snapshot: RunSnapshot,
}

/// Process-wide cancellation flag raised by SIGINT.
///
/// Share it with [`super::engine::CommandTestRunner::with_interrupt`] so a
/// suite in flight is killed as well.
pub fn interrupt_flag() -> Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    Arc::clone(FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))))
}

fn install_signal_handler_once() -> Result<(), MutationRunError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();

    let result = INIT.get_or_init(|| {
        let flag = interrupt_flag();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| e.to_string())
    });

    match result {
        Ok(()) => Ok(()),
        Err(msg) => Err(MutationRunError::Signal(msg.clone())),
    }
}

fn generate_run_id() -> String {
    let seq = RUN_SEQUENCE.fetch_add(1, Ordering::SeqCst);
    format!("run-{}-{}-{}", now_timestamp_ms(), std::process::id(), seq)
}

fn events_path(run_dir: &Path) -> PathBuf {
    run_dir.join("events.jsonl")
}

/// Load the schema named by `config` and enumerate its full catalog.
pub fn discover_mutants(config: &MutationConfig) -> Result<Vec<Mutant>, MutationRunError> {
    let endpoints = load_path(&config.schema_path)?;
    let mutants = enumerate_all(&endpoints, &config.catalog);
    info!(
        endpoints = endpoints.len(),
        mutants = mutants.len(),
        schema = %config.schema_path.display(),
        "enumerated mutation catalog"
    );
    Ok(mutants)
}

/// Keep mutants whose id or label contains `filter`.
pub fn filter_mutants(mut mutants: Vec<Mutant>, filter: Option<&str>) -> Vec<Mutant> {
    if let Some(filter) = filter {
        mutants.retain(|m| m.id.to_string() == filter || m.label().contains(filter));
    }
    mutants
}

/// Persists scheduler progress into the run's event log.
struct EventRecorder<'a> {
    run_id: &'a str,
    run_dir: &'a Path,
    events: &'a Path,
}

impl EventRecorder<'_> {
    fn write_log(&self, result: &MutationResult, log: &str) -> std::io::Result<Option<String>> {
        if log.is_empty() && !matches!(result.outcome, Outcome::Errored { .. }) {
            return Ok(None);
        }
        let base = self.run_dir.join("artifacts");
        std::fs::create_dir_all(&base)?;
        let name = format!("{}.log", result.mutant_id);
        let mut contents = log.to_string();
        if let Some(diagnostic) = &result.diagnostic {
            if log.is_empty() {
                contents.push_str(diagnostic);
                contents.push('\n');
            }
        }
        std::fs::write(base.join(&name), contents)?;
        Ok(Some(format!("artifacts/{name}")))
    }
}

impl RunObserver for EventRecorder<'_> {
    fn mutant_started(
        &mut self,
        _position: usize,
        _total: usize,
        mutant: &Mutant,
    ) -> Result<(), SchedulerError> {
        append_event(
            self.events,
            &MutationEvent::MutantStarted {
                run_id: self.run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                mutant_id: mutant.id,
            },
        )
        .map_err(|e| SchedulerError::Observer(e.to_string()))
    }

    fn mutant_finished(
        &mut self,
        _mutant: &Mutant,
        result: &MutationResult,
        log: &str,
    ) -> Result<(), SchedulerError> {
        let log_artifact_path = self
            .write_log(result, log)
            .map_err(|e| SchedulerError::Observer(e.to_string()))?;
        append_event(
            self.events,
            &MutationEvent::MutantFinished {
                run_id: self.run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                result: result.clone(),
                log_artifact_path,
            },
        )
        .map_err(|e| SchedulerError::Observer(e.to_string()))
    }
}

/// Drive `mutants` through the scheduler and close the session in the log.
fn execute(
    config: &MutationConfig,
    run_id: &str,
    run_dir: &Path,
    mutants: &[Mutant],
    runner: &dyn TestRunner,
) -> Result<(), MutationRunError> {
    let events = events_path(run_dir);
    let scheduler = Scheduler::new(InterceptionContext::new())
        .with_baseline(config.baseline)
        .with_interrupt(interrupt_flag());
    let mut recorder = EventRecorder {
        run_id,
        run_dir,
        events: &events,
    };

    let outcome = match scheduler.run_observed(mutants, runner, &mut recorder) {
        Ok(outcome) => outcome,
        Err(err) => {
            append_event(
                &events,
                &MutationEvent::RunInterrupted {
                    run_id: run_id.to_string(),
                    timestamp_ms: now_timestamp_ms(),
                    reason: err.to_string(),
                },
            )?;
            return Err(err.into());
        }
    };

    if outcome.interrupted {
        info!(run_id, "run interrupted, remaining mutants stay pending");
        append_event(
            &events,
            &MutationEvent::RunInterrupted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
                reason: "received interrupt signal".to_string(),
            },
        )?;
    } else {
        append_event(
            &events,
            &MutationEvent::RunCompleted {
                run_id: run_id.to_string(),
                timestamp_ms: now_timestamp_ms(),
            },
        )?;
    }
    Ok(())
}

/// Start a new mutation run over `mutants`, after applying the config filter.
pub fn run_new(
    config: &MutationConfig,
    mutants: Vec<Mutant>,
    runner: &dyn TestRunner,
) -> Result<RunResult, MutationRunError> {
    install_signal_handler_once()?;
    interrupt_flag().store(false, Ordering::SeqCst);

    let run_id = generate_run_id();
    let run_dir = config.run_root.join(&run_id);
    std::fs::create_dir_all(&run_dir)?;
    let events = events_path(&run_dir);

    let mutants = filter_mutants(mutants, config.filter.as_deref());
    info!(run_id = %run_id, mutants = mutants.len(), "starting mutation run");

    append_event(
        &events,
        &MutationEvent::RunStarted {
            run_id: run_id.clone(),
            timestamp_ms: now_timestamp_ms(),
            discovered: mutants.len(),
            config: Some(RunConfigSnapshot::from_config(config)),
        },
    )?;
    for mutant in &mutants {
        append_event(
            &events,
            &MutationEvent::MutantDiscovered {
                run_id: run_id.clone(),
                timestamp_ms: now_timestamp_ms(),
                mutant: mutant.clone(),
            },
        )?;
    }

    execute(config, &run_id, &run_dir, &mutants, runner)?;

    let snapshot = replay_events(&events)?;
    Ok(RunResult {
        run_id,
        run_dir,
        snapshot,
    })
}

/// Resume an existing run id, re-executing pending and interrupted mutants.
pub fn resume_run(
    config: &MutationConfig,
    run_id: &str,
    runner: &dyn TestRunner,
) -> Result<RunResult, MutationRunError> {
    install_signal_handler_once()?;
    interrupt_flag().store(false, Ordering::SeqCst);

    let run_dir = config.run_root.join(run_id);
    let events = events_path(&run_dir);
    let snapshot = replay_events(&events)?;

    if snapshot.completed {
        info!(run_id, "run already completed");
        return Ok(RunResult {
            run_id: run_id.to_string(),
            run_dir,
            snapshot,
        });
    }

    let pending = snapshot.pending_mutants();
    info!(run_id, remaining = pending.len(), "resuming mutation run");
    append_event(
        &events,
        &MutationEvent::RunResumed {
            run_id: run_id.to_string(),
            timestamp_ms: now_timestamp_ms(),
            remaining: pending.len(),
        },
    )?;

    execute(config, run_id, &run_dir, &pending, runner)?;

    let snapshot = replay_events(&events)?;
    Ok(RunResult {
        run_id: run_id.to_string(),
        run_dir,
        snapshot,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RunIdKey {
    timestamp_ms: i64,
    pid: u32,
    sequence: u64,
}

fn parse_run_id_key(run_id: &str) -> Option<RunIdKey> {
    let mut parts = run_id.split('-');
    if parts.next()? != "run" {
        return None;
    }

    Some(RunIdKey {
        timestamp_ms: parts.next()?.parse().ok()?,
        pid: parts.next()?.parse().ok()?,
        sequence: parts.next()?.parse().ok()?,
    })
}

/// Settings left unset in `config` (filter, timeout, test command) match any
/// recorded value; the schema must always agree.
fn is_snapshot_compatible(snapshot: &RunSnapshot, config: &MutationConfig) -> bool {
    let Some(recorded) = &snapshot.info.config else {
        return false;
    };
    let current = RunConfigSnapshot::from_config(config);
    recorded.schema_path == current.schema_path
        && current
            .filter
            .as_ref()
            .is_none_or(|filter| recorded.filter.as_ref() == Some(filter))
        && current
            .timeout_secs
            .is_none_or(|timeout| recorded.timeout_secs == Some(timeout))
        && (current.test_command.is_empty() || recorded.test_command == current.test_command)
}

/// Newest unfinished run recorded with inputs compatible with `config`.
pub fn latest_incomplete_run(config: &MutationConfig) -> Result<Option<String>, MutationRunError> {
    if !config.run_root.exists() {
        return Ok(None);
    }

    let mut newest: Option<(RunIdKey, String)> = None;

    for entry in std::fs::read_dir(&config.run_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let run_id = entry.file_name().to_string_lossy().to_string();
        let Some(key) = parse_run_id_key(&run_id) else {
            continue;
        };

        let snapshot = match load_run_status(config, &run_id) {
            Ok(snapshot) => snapshot,
            Err(MutationRunError::State(_)) => continue,
            Err(err) => return Err(err),
        };

        if snapshot.completed || snapshot.pending_mutants().is_empty() {
            continue;
        }
        if !is_snapshot_compatible(&snapshot, config) {
            continue;
        }

        if newest.as_ref().is_none_or(|(current, _)| key > *current) {
            newest = Some((key, run_id));
        }
    }

    Ok(newest.map(|(_, run_id)| run_id))
}

/// Load run status snapshot.
pub fn load_run_status(
    config: &MutationConfig,
    run_id: &str,
) -> Result<RunSnapshot, MutationRunError> {
    let events = events_path(&config.run_root.join(run_id));
    Ok(replay_events(&events)?)
}

/// Render run report.
pub fn render_run_report(
    config: &MutationConfig,
    run_id: &str,
    format: ReportFormat,
) -> Result<String, MutationRunError> {
    let snapshot = load_run_status(config, run_id)?;
    Ok(render_report(&snapshot, format))
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::catalog::{EndpointKey, MutantId};
    use crate::mutation::engine::{SuiteOutcome, TestInvocationError};
    use crate::mutation::state::MutationStatus;
    use crate::operators::MutationOperator;
    use crate::schema::Method;

    fn test_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn test_mutants(count: u32) -> Vec<Mutant> {
        (0..count)
            .map(|id| Mutant {
                id: MutantId(id),
                endpoint: EndpointKey {
                    method: Method::Get,
                    path: format!("/items/{id}"),
                },
                operator: MutationOperator::StatusCodeSwap { from: 200, to: 500 },
            })
            .collect()
    }

    fn config(root: &Path) -> MutationConfig {
        MutationConfig::default()
            .with_run_root(root)
            .with_baseline(false)
    }

    /// Kills even mutants, lets odd ones survive.
    fn even_killer(context: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError> {
        match context.armed() {
            Some(mutant) if mutant.id.0 % 2 == 0 => {
                Ok(SuiteOutcome::failed(["status check"]).with_log("FAIL status check\n"))
            }
            _ => Ok(SuiteOutcome::passed()),
        }
    }

    fn passing(_: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError> {
        Ok(SuiteOutcome::passed())
    }

    #[test]
    fn run_persists_outcomes_and_artifacts() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());

        let run = run_new(&config, test_mutants(3), &even_killer).expect("run should succeed");
        assert!(run.snapshot.completed);
        assert!(!run.snapshot.interrupted);
        assert_eq!(run.snapshot.count(MutationStatus::Killed), 2);
        assert_eq!(run.snapshot.count(MutationStatus::Survived), 1);

        let state = &run.snapshot.mutants[&MutantId(0)];
        assert_eq!(state.log_artifact_path.as_deref(), Some("artifacts/m0000.log"));
        let log = std::fs::read_to_string(run.run_dir.join("artifacts/m0000.log"))
            .expect("artifact should exist");
        assert!(log.contains("FAIL status check"));
        assert!(run.snapshot.mutants[&MutantId(1)].log_artifact_path.is_none());

        let replayed = load_run_status(&config, &run.run_id).expect("status should load");
        assert_eq!(replayed, run.snapshot);
    }

    #[test]
    fn filter_selects_by_label_or_id() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path()).with_filter("/items/2");

        let run = run_new(&config, test_mutants(4), &passing).expect("run should succeed");
        let ids: Vec<MutantId> = run.snapshot.mutants.keys().copied().collect();
        assert_eq!(ids, vec![MutantId(2)]);

        let by_id = filter_mutants(test_mutants(4), Some("m0003"));
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, MutantId(3));
    }

    #[test]
    fn interruption_leaves_pending_work_for_resume() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());

        let interrupting = |_: &InterceptionContext| -> Result<SuiteOutcome, TestInvocationError> {
            interrupt_flag().store(true, Ordering::SeqCst);
            Ok(SuiteOutcome::failed(["x"]))
        };
        let interrupted = run_new(&config, test_mutants(3), &interrupting).expect("run should succeed");
        assert!(interrupted.snapshot.interrupted);
        assert!(!interrupted.snapshot.completed);
        assert_eq!(interrupted.snapshot.pending_mutants().len(), 2);

        assert_eq!(
            latest_incomplete_run(&config).expect("lookup should work"),
            Some(interrupted.run_id.clone())
        );

        let resumed =
            resume_run(&config, &interrupted.run_id, &passing).expect("resume should succeed");
        assert!(resumed.snapshot.completed);
        assert!(!resumed.snapshot.interrupted);
        assert_eq!(resumed.snapshot.pending_mutants().len(), 0);
        assert_eq!(resumed.snapshot.mutants[&MutantId(0)].status, MutationStatus::Killed);
        assert_eq!(resumed.snapshot.count(MutationStatus::Survived), 2);
        assert_eq!(latest_incomplete_run(&config).expect("lookup should work"), None);
    }

    #[test]
    fn latest_incomplete_run_ignores_unset_settings() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let recorded = config(tmp.path())
            .with_test_command(["sh", "-c", "exit 0"])
            .with_timeout_secs(30)
            .with_filter("items");

        let interrupting = |_: &InterceptionContext| -> Result<SuiteOutcome, TestInvocationError> {
            interrupt_flag().store(true, Ordering::SeqCst);
            Ok(SuiteOutcome::failed(["x"]))
        };
        let run = run_new(&recorded, test_mutants(2), &interrupting).expect("run should succeed");
        interrupt_flag().store(false, Ordering::SeqCst);

        let bare = config(tmp.path());
        assert_eq!(
            latest_incomplete_run(&bare).expect("lookup should work"),
            Some(run.run_id.clone())
        );
        assert_eq!(
            latest_incomplete_run(&recorded).expect("lookup should work"),
            Some(run.run_id.clone())
        );

        for other in [
            bare.clone().with_test_command(["npm", "test"]),
            bare.clone().with_timeout_secs(5),
            bare.clone().with_filter("orders"),
            bare.clone().with_schema_path(tmp.path().join("other.yaml")),
        ] {
            assert_eq!(latest_incomplete_run(&other).expect("lookup should work"), None);
        }
    }

    #[test]
    fn resume_recovers_running_mutant() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());
        let run_id = "run-1-1-0";
        let run_dir = config.run_root.join(run_id);
        std::fs::create_dir_all(&run_dir).expect("run dir should be created");
        let events = run_dir.join("events.jsonl");

        append_event(
            &events,
            &MutationEvent::RunStarted {
                run_id: run_id.to_string(),
                timestamp_ms: 1,
                discovered: 1,
                config: Some(RunConfigSnapshot::from_config(&config)),
            },
        )
        .expect("run started should append");
        let mutant = test_mutants(1).remove(0);
        append_event(
            &events,
            &MutationEvent::MutantDiscovered {
                run_id: run_id.to_string(),
                timestamp_ms: 2,
                mutant,
            },
        )
        .expect("mutant discovered should append");
        append_event(
            &events,
            &MutationEvent::MutantStarted {
                run_id: run_id.to_string(),
                timestamp_ms: 3,
                mutant_id: MutantId(0),
            },
        )
        .expect("mutant started should append");

        let resumed = resume_run(&config, run_id, &even_killer).expect("resume should succeed");
        assert_eq!(resumed.snapshot.mutants[&MutantId(0)].status, MutationStatus::Killed);
        assert!(resumed.snapshot.completed);
    }

    #[test]
    fn resume_after_completion_keeps_terminal_outcomes_stable() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());

        let first = run_new(&config, test_mutants(2), &even_killer).expect("run should succeed");
        let second = resume_run(&config, &first.run_id, &passing).expect("resume should work");
        assert_eq!(second.snapshot, first.snapshot);
    }

    #[test]
    fn red_baseline_aborts_before_any_mutant() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path()).with_baseline(true);
        let failing = |_: &InterceptionContext| -> Result<SuiteOutcome, TestInvocationError> {
            Ok(SuiteOutcome::failed(["broken before mutation"]))
        };

        let err = run_new(&config, test_mutants(2), &failing).expect_err("baseline should fail");
        assert!(matches!(
            err,
            MutationRunError::Scheduler(SchedulerError::BaselineFailed { .. })
        ));

        let run_id = latest_incomplete_run(&config)
            .expect("lookup should work")
            .expect("run should stay resumable");
        let snapshot = load_run_status(&config, &run_id).expect("status should load");
        assert!(snapshot.interrupted);
        assert_eq!(snapshot.pending_mutants().len(), 2);
    }

    #[test]
    fn discover_mutants_reads_configured_schema() {
        let tmp = tempdir().expect("tempdir should be created");
        let schema = tmp.path().join("openapi.yaml");
        std::fs::write(
            &schema,
            "openapi: 3.0.3\n\
             paths:\n  /ping:\n    get:\n      responses:\n        200:\n          description: ok\n",
        )
        .expect("schema should be written");

        let config = MutationConfig::default().with_schema_path(&schema);
        let mutants = discover_mutants(&config).expect("schema should load");
        let labels: Vec<String> = mutants.iter().map(Mutant::label).collect();
        assert_eq!(labels, vec!["GET /ping status-code-swap status[200] (500)".to_string()]);

        let missing = MutationConfig::default().with_schema_path(tmp.path().join("nope.yaml"));
        assert!(matches!(
            discover_mutants(&missing),
            Err(MutationRunError::Schema(_))
        ));
    }

    #[test]
    fn load_status_for_missing_run_returns_io_error() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());

        let err = load_run_status(&config, "does-not-exist").expect_err("status should fail");
        match err {
            MutationRunError::State(MutationStateError::Io(_)) => {}
            other => panic!("expected IO state error, got {other:?}"),
        }
    }

    #[test]
    fn render_run_report_reads_persisted_events() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());

        let run = run_new(&config, test_mutants(2), &even_killer).expect("run should succeed");
        let md = render_run_report(&config, &run.run_id, ReportFormat::Markdown)
            .expect("report render should succeed");
        assert!(md.contains(&run.run_id));
        assert!(md.contains("| killed | 1 |"));
        assert!(md.contains("| mutation score | 50.00%"));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn run_handles_real_sigint_signal() {
        let _guard = test_guard();
        let tmp = tempdir().expect("tempdir should be created");
        let config = config(tmp.path());
        let slow = |_: &InterceptionContext| -> Result<SuiteOutcome, TestInvocationError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(SuiteOutcome::passed())
        };

        let pid = std::process::id().to_string();
        let signal_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(250));
            let _ = std::process::Command::new("kill")
                .arg("-INT")
                .arg(pid)
                .status();
        });

        let run = run_new(&config, test_mutants(20), &slow)
            .expect("run should complete with interruption");
        signal_thread
            .join()
            .expect("signal thread should join cleanly");

        assert!(run.snapshot.interrupted);
        assert!(!run.snapshot.completed);
        assert!(
            !run.snapshot.pending_mutants().is_empty(),
            "at least one mutant should remain pending after SIGINT"
        );
    }
}
