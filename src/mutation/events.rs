//! Event model for append-only mutation run logs.

use serde::{Deserialize, Serialize};

use crate::catalog::{Mutant, MutantId};

use super::config::MutationConfig;
use super::scheduler::MutationResult;

/// Run inputs recorded when a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfigSnapshot {
    /// Schema document the catalog was built from.
    pub schema_path: String,
    /// Label filter in effect.
    #[serde(default)]
    pub filter: Option<String>,
    /// Per-mutant timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Test command.
    #[serde(default)]
    pub test_command: Vec<String>,
}

impl RunConfigSnapshot {
    /// Snapshot of the fields of `config` that matter for reruns.
    pub fn from_config(config: &MutationConfig) -> Self {
        Self {
            schema_path: config.schema_path.display().to_string(),
            filter: config.filter.clone(),
            timeout_secs: config.timeout_secs,
            test_command: config.test_command.clone(),
        }
    }
}

/// Log event emitted during mutation orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MutationEvent {
    /// New run created.
    RunStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of mutants discovered for this run.
        discovered: usize,
        /// Inputs of the run.
        #[serde(default)]
        config: Option<RunConfigSnapshot>,
    },
    /// Existing run resumed.
    RunResumed {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Number of remaining mutants before resume.
        remaining: usize,
    },
    /// Mutant known for this run.
    MutantDiscovered {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Discovered mutant, complete enough to re-arm on resume.
        mutant: Mutant,
    },
    /// Mutant armed and suite started.
    MutantStarted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Mutant id.
        mutant_id: MutantId,
    },
    /// Mutant disarmed with a classification.
    MutantFinished {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Classified result.
        result: MutationResult,
        /// Relative path of the captured suite output.
        #[serde(default)]
        log_artifact_path: Option<String>,
    },
    /// Run interrupted by signal or operator.
    RunInterrupted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
        /// Free-form reason.
        reason: String,
    },
    /// Run completed terminally.
    RunCompleted {
        /// Run id.
        run_id: String,
        /// Unix timestamp millis.
        timestamp_ms: i64,
    },
}

/// Current unix timestamp in milliseconds.
pub fn now_timestamp_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_else(|_| std::time::Duration::from_secs(0));
    (duration.as_secs() as i64)
        .saturating_mul(1000)
        .saturating_add(duration.subsec_millis() as i64)
}
