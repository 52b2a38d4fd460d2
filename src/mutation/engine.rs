//! Test-suite invocation boundary and the external-command adapter.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::MutantId;
use crate::intercept::{
    ArmReport, INTERCEPT_ENV, InterceptionContext, MUTANT_ENV, REPORT_ENV, read_call_log,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static CALL_LOG_SEQ: AtomicU64 = AtomicU64::new(0);

/// The suite could not be run to a pass/fail verdict.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestInvocationError {
    /// The test command could not be started.
    #[error("failed to start test command `{command}`: {message}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// OS error text.
        message: String,
    },
    /// The suite ran longer than the configured timeout and was killed.
    #[error("test suite timed out after {0:?}")]
    TimedOut(Duration),
    /// The test command died abnormally or exited with an infrastructure error code.
    #[error("test command terminated abnormally: {0}")]
    Terminated(String),
    /// The run was cancelled by an interrupt.
    #[error("test run interrupted")]
    Interrupted,
    /// Any other runner failure.
    #[error("test runner failed: {0}")]
    Other(String),
}

/// Verdict of one complete suite run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuiteOutcome {
    /// Whether every test passed.
    pub all_passed: bool,
    /// Failing tests or failure summaries.
    pub failures: Vec<String>,
    /// Captured output.
    pub log: String,
    /// Interception bookkeeping reported by the suite's own processes, when it
    /// ran outside the scheduler's context.
    pub traffic: Option<ArmReport>,
}

impl SuiteOutcome {
    /// Every test passed.
    pub fn passed() -> Self {
        Self {
            all_passed: true,
            ..Self::default()
        }
    }

    /// At least one test failed.
    pub fn failed<I, S>(failures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            all_passed: false,
            failures: failures.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Attach captured output.
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    /// Attach call counts gathered by the test processes.
    pub fn with_traffic(mut self, traffic: ArmReport) -> Self {
        self.traffic = Some(traffic);
        self
    }
}

/// Runs the whole test suite once against whatever is armed in `context`.
pub trait TestRunner {
    /// Run the suite to completion and report pass/fail, or why it could not run.
    fn run_suite(&self, context: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError>;
}

impl<F> TestRunner for F
where
    F: Fn(&InterceptionContext) -> Result<SuiteOutcome, TestInvocationError>,
{
    fn run_suite(&self, context: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError> {
        self(context)
    }
}

/// Runs an external test command with interception activated through the environment.
///
/// The child sees `APIMUTANT_INTERCEPT=1` and, when a mutant is armed, the
/// mutant as JSON in `APIMUTANT_MUTANT` and a call log path in
/// `APIMUTANT_REPORT`. Whatever the child's contexts append there comes back as
/// [`SuiteOutcome::traffic`]. Exit code 0 means the suite passed; any other
/// code means it failed, unless listed in `error_exit_codes`.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    error_exit_codes: Vec<i32>,
    interrupt: Option<Arc<AtomicBool>>,
    call_log_dir: Option<PathBuf>,
}

impl CommandTestRunner {
    /// Runner for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
            error_exit_codes: Vec::new(),
            interrupt: None,
            call_log_dir: None,
        }
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run in `dir`.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Kill the suite after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Treat these exit codes as infrastructure errors.
    pub fn with_error_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.error_exit_codes.extend(codes);
        self
    }

    /// Kill the suite when `flag` is raised.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Directory for per-cycle call logs; the system temp dir by default.
    pub fn with_call_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.call_log_dir = Some(dir.into());
        self
    }

    fn call_log_path(&self, mutant: MutantId) -> PathBuf {
        let dir = self
            .call_log_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let seq = CALL_LOG_SEQ.fetch_add(1, Ordering::Relaxed);
        dir.join(format!(
            "apimutant-calls-{}-{seq}-{mutant}.jsonl",
            std::process::id()
        ))
    }

    fn command(
        &self,
        context: &InterceptionContext,
        call_log: Option<&Path>,
    ) -> Result<Command, TestInvocationError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env(INTERCEPT_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        match context.armed() {
            Some(mutant) => {
                let payload = serde_json::to_string(mutant.as_ref())
                    .map_err(|e| TestInvocationError::Other(e.to_string()))?;
                cmd.env(MUTANT_ENV, payload);
            }
            None => {
                cmd.env_remove(MUTANT_ENV);
            }
        }
        match call_log {
            Some(path) => cmd.env(REPORT_ENV, path),
            None => cmd.env_remove(REPORT_ENV),
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, TestInvocationError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(err) => return Err(TestInvocationError::Other(err.to_string())),
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    stop(child);
                    return Err(TestInvocationError::TimedOut(timeout));
                }
            }
            if self
                .interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
            {
                stop(child);
                return Err(TestInvocationError::Interrupted);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<String>> {
    source.map(|mut source| {
        std::thread::spawn(move || {
            let mut raw = Vec::new();
            let _ = source.read_to_end(&mut raw);
            String::from_utf8_lossy(&raw).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl TestRunner for CommandTestRunner {
    fn run_suite(&self, context: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError> {
        let call_log = context
            .armed()
            .map(|mutant| (mutant.id, self.call_log_path(mutant.id)));
        if let Some((_, path)) = &call_log {
            let _ = std::fs::remove_file(path);
        }
        let mut cmd = self.command(context, call_log.as_ref().map(|(_, path)| path.as_path()))?;
        debug!(program = %self.program, armed = context.is_armed(), "starting test command");
        let mut child = cmd.spawn().map_err(|err| TestInvocationError::Spawn {
            command: self.program.clone(),
            message: err.to_string(),
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        // On timeout or interrupt the readers are left detached: grandchildren
        // may still hold the pipes open.
        let status = self.wait(&mut child);
        let traffic = call_log.and_then(|(mutant, path)| {
            let read = read_call_log(&path, mutant);
            let _ = std::fs::remove_file(&path);
            read.map_err(|err| {
                warn!(path = %path.display(), error = %err, "could not read call log");
            })
            .ok()
        });
        let status = status?;
        let mut log = collect(stdout);
        log.push_str(&collect(stderr));

        let outcome = match status.code() {
            Some(0) => SuiteOutcome::passed(),
            Some(code) if self.error_exit_codes.contains(&code) => {
                return Err(TestInvocationError::Terminated(format!("exit code {code}")));
            }
            Some(code) => SuiteOutcome::failed([format!("test command exited with code {code}")]),
            None => {
                return Err(TestInvocationError::Terminated(format!(
                    "killed by signal ({status})"
                )));
            }
        };
        let outcome = outcome.with_log(log);
        Ok(match traffic {
            Some(traffic) => outcome.with_traffic(traffic),
            None => outcome,
        })
    }
}
