//! The armed-mutant slot shared between a scheduler and the traffic it observes.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{Mutant, MutantId};
use crate::operators::{MutantApplicationError, PayloadSide};

use super::http::{HttpRequest, HttpResponse};
use super::path::normalize_path;

/// Environment variable that turns interception on in a test process.
pub const INTERCEPT_ENV: &str = "APIMUTANT_INTERCEPT";

/// Environment variable carrying the armed mutant (JSON) into a test process.
pub const MUTANT_ENV: &str = "APIMUTANT_MUTANT";

/// Environment variable naming the file a test process appends its
/// intercepted-call records to, one JSON object per line.
pub const REPORT_ENV: &str = "APIMUTANT_REPORT";

/// Raised when arming while another mutant is armed. The armed mutant is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mutant {armed} is already armed; refusing to arm {requested}")]
pub struct AlreadyArmedError {
    /// Mutant currently armed.
    pub armed: MutantId,
    /// Mutant that was rejected.
    pub requested: MutantId,
}

/// Failure to build a context from the process environment.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// `APIMUTANT_MUTANT` did not hold a mutant.
    #[error("invalid APIMUTANT_MUTANT payload: {0}")]
    InvalidMutant(#[from] serde_json::Error),
}

/// Bookkeeping for one arm/disarm cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmReport {
    /// Mutant that was armed.
    pub mutant: MutantId,
    /// Calls whose method and path matched the mutant.
    pub matched_calls: usize,
    /// Transformations actually applied.
    pub applied: usize,
    /// Transformations that could not be applied.
    pub failures: Vec<MutantApplicationError>,
}

impl ArmReport {
    fn empty(mutant: MutantId) -> Self {
        Self {
            mutant,
            matched_calls: 0,
            applied: 0,
            failures: Vec::new(),
        }
    }

    /// Add the counts another context observed for the same cycle.
    pub fn absorb(&mut self, other: &ArmReport) {
        self.matched_calls += other.matched_calls;
        self.applied += other.applied;
        self.failures.extend(other.failures.iter().cloned());
    }
}

/// One line of the call log written under [`REPORT_ENV`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
enum CallRecord {
    Matched { mutant: MutantId },
    Applied { mutant: MutantId },
    Failed { mutant: MutantId, error: String },
}

/// Fold the call log at `path` into a report for `mutant`.
///
/// A missing file means the process never matched a call. Lines that do not
/// parse, or that belong to another mutant, are skipped.
pub fn read_call_log(path: &Path, mutant: MutantId) -> io::Result<ArmReport> {
    let mut report = ArmReport::empty(mutant);
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(err) => return Err(err),
    };
    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        match serde_json::from_str::<CallRecord>(line) {
            Ok(CallRecord::Matched { mutant: id }) if id == mutant => report.matched_calls += 1,
            Ok(CallRecord::Applied { mutant: id }) if id == mutant => report.applied += 1,
            Ok(CallRecord::Failed { mutant: id, error }) if id == mutant => report
                .failures
                .push(MutantApplicationError::Reported(error)),
            Ok(_) => {}
            Err(err) => debug!(path = %path.display(), error = %err, "skipping call log line"),
        }
    }
    Ok(report)
}

#[derive(Debug)]
struct Armed {
    mutant: Arc<Mutant>,
    report: ArmReport,
}

/// Decision taken for a request, carried to the matching response.
///
/// The request is matched once; the response hook only acts if the same
/// mutant is still armed when the response arrives.
#[derive(Debug, Clone, Default)]
pub struct CallTicket {
    mutant: Option<Arc<Mutant>>,
}

impl CallTicket {
    /// Ticket for a call no mutant applies to.
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Whether the armed mutant matched the request.
    pub fn is_matched(&self) -> bool {
        self.mutant.is_some()
    }

    /// The matched mutant.
    pub fn mutant(&self) -> Option<&Mutant> {
        self.mutant.as_deref()
    }
}

/// Cloneable handle to one armed-mutant slot.
///
/// At most one mutant is armed per context. Clones share the slot, so the
/// scheduler and the transport wrapper see the same state.
#[derive(Debug, Clone, Default)]
pub struct InterceptionContext {
    slot: Arc<Mutex<Option<Armed>>>,
    call_log: Option<Arc<PathBuf>>,
}

impl InterceptionContext {
    /// Unarmed context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a test process, driven by `flag` (`APIMUTANT_INTERCEPT`) and
    /// `mutant_json` (`APIMUTANT_MUTANT`).
    ///
    /// Returns `None` when the flag is unset or false, meaning no traffic may be
    /// altered. With the flag on and no mutant, the context is unarmed.
    pub fn from_vars(
        flag: Option<&str>,
        mutant_json: Option<&str>,
    ) -> Result<Option<Self>, ActivationError> {
        if !flag.is_some_and(is_truthy) {
            return Ok(None);
        }
        let context = Self::new();
        if let Some(json) = mutant_json.filter(|json| !json.trim().is_empty()) {
            let mutant: Mutant = serde_json::from_str(json)?;
            *context.lock() = Some(Armed {
                report: ArmReport::empty(mutant.id),
                mutant: Arc::new(mutant),
            });
        }
        Ok(Some(context))
    }

    /// [`InterceptionContext::from_vars`] over the process environment, also
    /// honouring [`REPORT_ENV`].
    pub fn from_env() -> Result<Option<Self>, ActivationError> {
        let flag = std::env::var(INTERCEPT_ENV).ok();
        let mutant = std::env::var(MUTANT_ENV).ok();
        let context = Self::from_vars(flag.as_deref(), mutant.as_deref())?;
        Ok(context.map(|context| match std::env::var_os(REPORT_ENV) {
            Some(path) if !path.is_empty() => context.with_call_log(path),
            _ => context,
        }))
    }

    /// Append a record of every matched call, applied transformation and
    /// application failure to `path`, for a parent process to read back with
    /// [`read_call_log`].
    pub fn with_call_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.call_log = Some(Arc::new(path.into()));
        self
    }

    fn record(&self, record: CallRecord) {
        let Some(path) = self.call_log.as_deref() else {
            return;
        };
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "could not encode call record");
                return;
            }
        };
        line.push('\n');
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            warn!(path = %path.display(), error = %err, "could not append call record");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Armed>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm `mutant`. Fails without side effects if another mutant is armed.
    pub fn arm(&self, mutant: impl Into<Arc<Mutant>>) -> Result<(), AlreadyArmedError> {
        let mutant = mutant.into();
        let mut slot = self.lock();
        if let Some(current) = slot.as_ref() {
            return Err(AlreadyArmedError {
                armed: current.mutant.id,
                requested: mutant.id,
            });
        }
        debug!(mutant = %mutant.id, "armed");
        *slot = Some(Armed {
            report: ArmReport::empty(mutant.id),
            mutant,
        });
        Ok(())
    }

    /// Disarm whatever is armed and return its bookkeeping.
    pub fn disarm(&self) -> Option<ArmReport> {
        let armed = self.lock().take()?;
        debug!(mutant = %armed.mutant.id, "disarmed");
        Some(armed.report)
    }

    fn disarm_if(&self, mutant: &Arc<Mutant>) -> Option<ArmReport> {
        let mut slot = self.lock();
        let is_same = slot
            .as_ref()
            .is_some_and(|armed| Arc::ptr_eq(&armed.mutant, mutant));
        if !is_same {
            return None;
        }
        let armed = slot.take()?;
        debug!(mutant = %armed.mutant.id, "disarmed");
        Some(armed.report)
    }

    /// Arm `mutant` for the lifetime of the returned guard.
    pub fn arm_scoped(&self, mutant: impl Into<Arc<Mutant>>) -> Result<ArmGuard, AlreadyArmedError> {
        let mutant = mutant.into();
        self.arm(Arc::clone(&mutant))?;
        Ok(ArmGuard {
            context: self.clone(),
            mutant,
            released: false,
        })
    }

    /// Currently armed mutant.
    pub fn armed(&self) -> Option<Arc<Mutant>> {
        self.lock().as_ref().map(|armed| Arc::clone(&armed.mutant))
    }

    /// Whether a mutant is armed.
    pub fn is_armed(&self) -> bool {
        self.lock().is_some()
    }

    /// Request hook: match the call against the armed mutant and rewrite the
    /// request when the mutant is request-side.
    pub fn intercept_request(&self, request: &mut HttpRequest) -> CallTicket {
        let mut slot = self.lock();
        let Some(armed) = slot.as_mut() else {
            return CallTicket::passthrough();
        };

        let path = normalize_path(&request.url);
        if !armed.mutant.matches(request.method, &path) {
            debug!(mutant = %armed.mutant.id, method = %request.method, path = %path, "call not matched");
            return CallTicket::passthrough();
        }
        armed.report.matched_calls += 1;
        let id = armed.mutant.id;
        self.record(CallRecord::Matched { mutant: id });

        if armed.mutant.operator.side() == PayloadSide::Request {
            match armed.mutant.operator.apply_request(request) {
                Ok(()) => {
                    armed.report.applied += 1;
                    self.record(CallRecord::Applied { mutant: id });
                    debug!(mutant = %id, path = %path, "request mutated");
                }
                Err(err) => {
                    warn!(
                        mutant = %id,
                        path = %path,
                        error = %err,
                        "mutant could not be applied to request"
                    );
                    self.record(CallRecord::Failed {
                        mutant: id,
                        error: err.to_string(),
                    });
                    armed.report.failures.push(err);
                }
            }
        }

        CallTicket {
            mutant: Some(Arc::clone(&armed.mutant)),
        }
    }

    /// Response hook: rewrite the response when the ticket's mutant is still
    /// armed, is response-side and covers the response status.
    pub fn intercept_response(&self, ticket: &CallTicket, response: &mut HttpResponse) {
        let Some(mutant) = ticket.mutant.as_ref() else {
            return;
        };
        if mutant.operator.side() != PayloadSide::Response || !mutant.matches_status(response.status)
        {
            return;
        }
        if !mutant.operator.applies_to(response) {
            debug!(mutant = %mutant.id, "rule does not hold on this response; left untouched");
            return;
        }

        let delay = {
            let mut slot = self.lock();
            let Some(armed) = slot.as_mut() else {
                return;
            };
            if !Arc::ptr_eq(&armed.mutant, mutant) {
                return;
            }
            match mutant.operator.apply_response(response) {
                Ok(()) => {
                    armed.report.applied += 1;
                    self.record(CallRecord::Applied { mutant: mutant.id });
                    debug!(mutant = %mutant.id, status = response.status, "response mutated");
                    mutant.operator.delay()
                }
                Err(err) => {
                    warn!(mutant = %mutant.id, error = %err, "mutant could not be applied to response");
                    self.record(CallRecord::Failed {
                        mutant: mutant.id,
                        error: err.to_string(),
                    });
                    armed.report.failures.push(err);
                    None
                }
            }
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Keeps a mutant armed until released or dropped.
///
/// Dropping the guard disarms, including during unwinding, so a failed or
/// panicking suite run cannot leave the mutant armed.
#[derive(Debug)]
pub struct ArmGuard {
    context: InterceptionContext,
    mutant: Arc<Mutant>,
    released: bool,
}

impl ArmGuard {
    /// The armed mutant.
    pub fn mutant(&self) -> &Mutant {
        &self.mutant
    }

    /// Disarm now and return the cycle's bookkeeping.
    pub fn release(mut self) -> ArmReport {
        self.released = true;
        self.context
            .disarm_if(&self.mutant)
            .unwrap_or_else(|| ArmReport::empty(self.mutant.id))
    }
}

impl Drop for ArmGuard {
    fn drop(&mut self) {
        if !self.released {
            self.context.disarm_if(&self.mutant);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::catalog::EndpointKey;
    use crate::invariant::{Check, Condition, InvariantRule};
    use crate::operators::{FieldTarget, MutationOperator};
    use crate::schema::Method;

    fn null_id_mutant(id: u32) -> Mutant {
        Mutant {
            id: MutantId(id),
            endpoint: EndpointKey {
                method: Method::Get,
                path: "/orders/{id}".to_string(),
            },
            operator: MutationOperator::NullField {
                target: FieldTarget::response(200, vec!["id".to_string()]),
            },
        }
    }

    fn order_response() -> HttpResponse {
        HttpResponse::new(200).with_json(&json!({ "id": "o-1", "quantity": 3 }))
    }

    #[test]
    fn arm_while_armed_fails_and_keeps_first() {
        let context = InterceptionContext::new();
        context.arm(null_id_mutant(1)).expect("first arm should succeed");

        let err = context
            .arm(null_id_mutant(2))
            .expect_err("second arm should fail");
        assert_eq!(
            err,
            AlreadyArmedError {
                armed: MutantId(1),
                requested: MutantId(2)
            }
        );
        assert_eq!(context.armed().map(|m| m.id), Some(MutantId(1)));

        let report = context.disarm().expect("disarm should report");
        assert_eq!(report.mutant, MutantId(1));
        assert!(!context.is_armed());
        assert!(context.disarm().is_none());
    }

    #[test]
    fn matching_calls_are_rewritten_and_counted() {
        let context = InterceptionContext::new();
        context.arm(null_id_mutant(0)).expect("arm should succeed");

        let mut request = HttpRequest::new(Method::Get, "http://svc/orders/7?x=1");
        let ticket = context.intercept_request(&mut request);
        assert!(ticket.is_matched());

        let mut response = order_response();
        context.intercept_response(&ticket, &mut response);
        assert_eq!(
            response.json().expect("json"),
            json!({ "id": null, "quantity": 3 })
        );

        let report = context.disarm().expect("report");
        assert_eq!(report.matched_calls, 1);
        assert_eq!(report.applied, 1);
        assert!(report.failures.is_empty());
    }

    #[test]
    fn non_matching_calls_are_byte_identical() {
        let context = InterceptionContext::new();
        context.arm(null_id_mutant(0)).expect("arm should succeed");

        for (method, url) in [
            (Method::Post, "/orders/7"),
            (Method::Get, "/orders"),
            (Method::Get, "/customers/7"),
        ] {
            let original = HttpRequest::new(method, url).with_json(&json!({ "id": "x" }));
            let mut request = original.clone();
            let ticket = context.intercept_request(&mut request);
            assert_eq!(request, original);

            let mut response = order_response();
            context.intercept_response(&ticket, &mut response);
            assert_eq!(response, order_response());
        }

        let mut request = HttpRequest::new(Method::Get, "/orders/7");
        let ticket = context.intercept_request(&mut request);
        let mut not_found = HttpResponse::new(404).with_json(&json!({ "id": "o-1" }));
        context.intercept_response(&ticket, &mut not_found);
        assert_eq!(
            not_found,
            HttpResponse::new(404).with_json(&json!({ "id": "o-1" }))
        );
    }

    #[test]
    fn unarmed_context_passes_everything_through() {
        let context = InterceptionContext::new();
        let mut request = HttpRequest::new(Method::Get, "/orders/1");
        let ticket = context.intercept_request(&mut request);
        assert!(!ticket.is_matched());
        let mut response = order_response();
        context.intercept_response(&ticket, &mut response);
        assert_eq!(response, order_response());
    }

    #[test]
    fn application_failures_are_recorded() {
        let context = InterceptionContext::new();
        context.arm(null_id_mutant(0)).expect("arm should succeed");
        let mut request = HttpRequest::new(Method::Get, "/orders/1");
        let ticket = context.intercept_request(&mut request);
        let mut response = HttpResponse::new(200).with_json(&json!({ "other": 1 }));
        context.intercept_response(&ticket, &mut response);

        let report = context.disarm().expect("report");
        assert_eq!(report.applied, 0);
        assert_eq!(
            report.failures,
            vec![MutantApplicationError::FieldAbsent("id".to_string())]
        );
    }

    #[test]
    fn invariant_mutants_skip_responses_where_the_rule_is_vacuous() {
        let rule = InvariantRule::new(
            "positive-quantity",
            Method::Get,
            "/orders/{id}",
            Condition::new("quantity", Check::GreaterThan(json!(0))),
        );
        let operator = MutationOperator::invariant_violations(&rule).remove(0);
        let context = InterceptionContext::new();
        context
            .arm(Mutant {
                operator,
                ..null_id_mutant(0)
            })
            .expect("arm should succeed");

        let mut request = HttpRequest::new(Method::Get, "/orders/1");
        let ticket = context.intercept_request(&mut request);
        let mut empty_order = HttpResponse::new(200).with_json(&json!({ "quantity": 0 }));
        context.intercept_response(&ticket, &mut empty_order);
        assert_eq!(
            empty_order,
            HttpResponse::new(200).with_json(&json!({ "quantity": 0 }))
        );

        let ticket = context.intercept_request(&mut request);
        let mut response = order_response();
        context.intercept_response(&ticket, &mut response);
        assert_eq!(response.json().expect("json")["quantity"], json!(0));

        let report = context.disarm().expect("report");
        assert_eq!((report.matched_calls, report.applied), (2, 1));
        assert!(report.failures.is_empty());
    }

    #[test]
    fn call_log_carries_the_cycle_to_another_process() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let log = dir.path().join("calls.jsonl");
        let payload = serde_json::to_string(&null_id_mutant(4)).expect("serialize");
        let child = InterceptionContext::from_vars(Some("1"), Some(&payload))
            .expect("valid payload")
            .expect("context should exist")
            .with_call_log(&log);

        for body in [json!({ "id": "o-1" }), json!({ "other": 1 })] {
            let mut request = HttpRequest::new(Method::Get, "/orders/1");
            let ticket = child.intercept_request(&mut request);
            let mut response = HttpResponse::new(200).with_json(&body);
            child.intercept_response(&ticket, &mut response);
        }
        let mut unrelated = HttpRequest::new(Method::Get, "/customers/1");
        child.intercept_request(&mut unrelated);
        std::fs::write(
            &log,
            format!(
                "{}not json\n{{\"call\":\"matched\",\"mutant\":\"m0099\"}}\n",
                std::fs::read_to_string(&log).expect("log should exist")
            ),
        )
        .expect("log should be writable");

        let report = read_call_log(&log, MutantId(4)).expect("log should read");
        assert_eq!(report.matched_calls, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(
            report.failures,
            vec![MutantApplicationError::Reported(
                "target field `id` is absent from the body".to_string()
            )]
        );

        let mut parent = ArmReport::empty(MutantId(4));
        parent.absorb(&report);
        assert_eq!(parent, report);

        let missing = read_call_log(&dir.path().join("none.jsonl"), MutantId(4))
            .expect("missing log is empty");
        assert_eq!(missing.matched_calls, 0);
        assert!(missing.failures.is_empty());
    }

    #[test]
    fn stale_ticket_does_not_touch_response() {
        let context = InterceptionContext::new();
        context.arm(null_id_mutant(0)).expect("arm should succeed");
        let mut request = HttpRequest::new(Method::Get, "/orders/1");
        let ticket = context.intercept_request(&mut request);
        context.disarm();
        context.arm(null_id_mutant(0)).expect("re-arm should succeed");

        let mut response = order_response();
        context.intercept_response(&ticket, &mut response);
        assert_eq!(response, order_response());
    }

    #[test]
    fn guard_disarms_on_release_drop_and_panic() {
        let context = InterceptionContext::new();

        let guard = context.arm_scoped(null_id_mutant(1)).expect("arm");
        assert!(context.is_armed());
        let report = guard.release();
        assert_eq!(report.mutant, MutantId(1));
        assert!(!context.is_armed());

        {
            let _guard = context.arm_scoped(null_id_mutant(2)).expect("arm");
            assert!(context.is_armed());
        }
        assert!(!context.is_armed());

        let shared = context.clone();
        let panicked = std::panic::catch_unwind(move || {
            let _guard = shared.arm_scoped(null_id_mutant(3)).expect("arm");
            panic!("suite exploded");
        });
        assert!(panicked.is_err());
        assert!(!context.is_armed());
        context.arm(null_id_mutant(4)).expect("context should be usable after panic");
    }

    #[test]
    fn activation_flag_gates_interception() {
        assert!(
            InterceptionContext::from_vars(None, None)
                .expect("no flag is fine")
                .is_none()
        );
        assert!(
            InterceptionContext::from_vars(Some("false"), Some("{}"))
                .expect("false flag ignores payload")
                .is_none()
        );

        let unarmed = InterceptionContext::from_vars(Some("1"), None)
            .expect("flag alone is fine")
            .expect("context should exist");
        assert!(!unarmed.is_armed());

        let payload = serde_json::to_string(&null_id_mutant(9)).expect("serialize");
        let armed = InterceptionContext::from_vars(Some("TRUE"), Some(&payload))
            .expect("valid payload")
            .expect("context should exist");
        assert_eq!(armed.armed().map(|m| m.id), Some(MutantId(9)));

        assert!(matches!(
            InterceptionContext::from_vars(Some("yes"), Some("not json")),
            Err(ActivationError::InvalidMutant(_))
        ));
    }
}
