//! Mutant scheduling, resumable run orchestration and reporting.

pub mod config;
pub mod engine;
pub mod events;
/// Human-readable and machine-friendly report generation.
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use config::{ConfigError, MutationConfig};
pub use engine::{CommandTestRunner, SuiteOutcome, TestInvocationError, TestRunner};
pub use events::{MutationEvent, RunConfigSnapshot};
pub use report::{
    ConfidenceInterval, ErrorGroup, MutationReport, OperatorBreakdown, ReportFormat,
    render_report, summarize,
};
pub use runner::{
    MutationRunError, RunResult, discover_mutants, filter_mutants, interrupt_flag,
    latest_incomplete_run, load_run_status, render_run_report, resume_run, run_new,
};
pub use scheduler::{
    ErrorCause, MutationResult, Outcome, RunObserver, ScheduleResult, Scheduler, SchedulerError,
};
pub use state::{MutationStatus, RunInfo, RunSnapshot};
