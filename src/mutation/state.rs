//! Event replay and run-state projection.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use thiserror::Error;

use crate::catalog::{Mutant, MutantId};

use super::events::{MutationEvent, RunConfigSnapshot};
use super::scheduler::{MutationResult, Outcome};

/// Status derived from event stream for each mutant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    /// Discovered and not started.
    Pending,
    /// Started but no terminal outcome yet.
    Running,
    /// Terminal: killed.
    Killed,
    /// Terminal: survived.
    Survived,
    /// Terminal: errored.
    Errored,
}

impl MutationStatus {
    /// True if status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Killed | Self::Survived | Self::Errored)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Killed => "killed",
            Self::Survived => "survived",
            Self::Errored => "errored",
        }
    }
}

impl From<Outcome> for MutationStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Killed => Self::Killed,
            Outcome::Survived => Self::Survived,
            Outcome::Errored { .. } => Self::Errored,
        }
    }
}

/// Per-mutant state in replay snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutantState {
    /// The mutant.
    pub mutant: Mutant,
    /// Derived status.
    pub status: MutationStatus,
    /// Mutant execution start timestamp.
    pub started_at_ms: Option<i64>,
    /// Mutant execution finish timestamp.
    pub finished_at_ms: Option<i64>,
    /// Terminal result, once finished.
    pub result: Option<MutationResult>,
    /// Relative path to the suite output.
    pub log_artifact_path: Option<String>,
}

/// Run-level metadata from the `run_started` event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunInfo {
    /// Inputs of the run, when recorded.
    pub config: Option<RunConfigSnapshot>,
    /// Start timestamp.
    pub started_at_ms: Option<i64>,
}

/// Materialized run state derived from `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    /// Run id.
    pub run_id: String,
    /// Mutants by id.
    pub mutants: BTreeMap<MutantId, MutantState>,
    /// Number of malformed event lines ignored.
    pub malformed_lines: usize,
    /// Whether the latest session was interrupted.
    pub interrupted: bool,
    /// Whether a completion event has occurred.
    pub completed: bool,
    /// Run metadata.
    pub info: RunInfo,
}

impl RunSnapshot {
    /// Collect remaining mutants to execute/re-execute, in catalog order.
    pub fn pending_mutants(&self) -> Vec<Mutant> {
        self.mutants
            .values()
            .filter(|m| !m.status.is_terminal())
            .map(|m| m.mutant.clone())
            .collect()
    }

    /// Terminal results in catalog order.
    pub fn results(&self) -> Vec<MutationResult> {
        self.mutants
            .values()
            .filter_map(|m| m.result.clone())
            .collect()
    }

    /// Number of mutants with `status`.
    pub fn count(&self, status: MutationStatus) -> usize {
        self.mutants.values().filter(|m| m.status == status).count()
    }
}

/// State replay errors.
#[derive(Debug, Error)]
pub enum MutationStateError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Replay event log from `events.jsonl` into a snapshot.
pub fn replay_events(events_path: &Path) -> Result<RunSnapshot, MutationStateError> {
    let file = std::fs::File::open(events_path)?;
    let reader = BufReader::new(file);

    let mut run_id = String::new();
    let mut mutants: BTreeMap<MutantId, MutantState> = BTreeMap::new();
    let mut malformed_lines = 0;
    let mut interrupted = false;
    let mut completed = false;
    let mut info = RunInfo::default();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<MutationEvent>(&line) {
            Ok(event) => event,
            Err(_) => {
                malformed_lines += 1;
                continue;
            }
        };

        match event {
            MutationEvent::RunStarted {
                run_id: id,
                timestamp_ms,
                config,
                ..
            } => {
                if run_id.is_empty() {
                    run_id = id;
                }
                info.started_at_ms = Some(timestamp_ms);
                info.config = config;
            }
            MutationEvent::RunResumed { run_id: id, .. } => {
                if run_id.is_empty() {
                    run_id = id;
                }
                interrupted = false;
            }
            MutationEvent::MutantDiscovered { mutant, .. } => {
                mutants.insert(
                    mutant.id,
                    MutantState {
                        mutant,
                        status: MutationStatus::Pending,
                        started_at_ms: None,
                        finished_at_ms: None,
                        result: None,
                        log_artifact_path: None,
                    },
                );
            }
            MutationEvent::MutantStarted {
                mutant_id,
                timestamp_ms,
                ..
            } => {
                if let Some(state) = mutants.get_mut(&mutant_id) {
                    state.status = MutationStatus::Running;
                    state.started_at_ms = Some(timestamp_ms);
                }
            }
            MutationEvent::MutantFinished {
                result,
                log_artifact_path,
                timestamp_ms,
                ..
            } => {
                if let Some(state) = mutants.get_mut(&result.mutant_id) {
                    state.finished_at_ms = Some(timestamp_ms);
                    state.status = result.outcome.into();
                    state.log_artifact_path = log_artifact_path;
                    state.result = Some(result);
                }
            }
            MutationEvent::RunInterrupted { .. } => {
                interrupted = true;
            }
            MutationEvent::RunCompleted { .. } => {
                completed = true;
                interrupted = false;
            }
        }
    }

    Ok(RunSnapshot {
        run_id,
        mutants,
        malformed_lines,
        interrupted,
        completed,
        info,
    })
}

/// Append one event as JSONL line.
pub fn append_event(events_path: &Path, event: &MutationEvent) -> Result<(), MutationStateError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path)?;
    let json = serde_json::to_string(event).expect("mutation events should serialize");
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}
