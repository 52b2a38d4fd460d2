//! Mutation operators: the closed set of faults and how each one rewrites traffic.
//!
//! Every operator is a pure transformation of a single request or response.
//! Field operators edit one JSON value addressed by a [`FieldTarget`] and leave
//! the rest of the document untouched; an operator that cannot find or
//! recognise its target reports a [`MutantApplicationError`] instead of
//! guessing.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::intercept::http::{HttpRequest, HttpResponse, remove_header, set_header};
use crate::invariant::{Condition, InvariantRule, Violation};

/// Operator kinds in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatorKind {
    /// Drop a field from the payload.
    FieldOmission,
    /// Replace a field with `null`.
    NullField,
    /// Replace a number or boolean with its string form.
    TypeCoercion,
    /// Replace a string with `""`.
    EmptyString,
    /// Replace an array with `[]`.
    EmptyList,
    /// Replace a value with one just outside its declared range.
    BoundarySubstitution,
    /// Turn a success status into an error status.
    StatusCodeSwap,
    /// Remove or rewrite a header.
    HeaderTamper,
    /// Delay the response.
    LatencyInjection,
    /// Break a configured business-rule invariant.
    InvariantViolation,
}

impl OperatorKind {
    /// Every kind, in catalog order.
    pub const ALL: [OperatorKind; 10] = [
        OperatorKind::FieldOmission,
        OperatorKind::NullField,
        OperatorKind::TypeCoercion,
        OperatorKind::EmptyString,
        OperatorKind::EmptyList,
        OperatorKind::BoundarySubstitution,
        OperatorKind::StatusCodeSwap,
        OperatorKind::HeaderTamper,
        OperatorKind::LatencyInjection,
        OperatorKind::InvariantViolation,
    ];

    /// Stable kebab-case name used in reports and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::FieldOmission => "field-omission",
            OperatorKind::NullField => "null-field",
            OperatorKind::TypeCoercion => "type-coercion",
            OperatorKind::EmptyString => "empty-string",
            OperatorKind::EmptyList => "empty-list",
            OperatorKind::BoundarySubstitution => "boundary-substitution",
            OperatorKind::StatusCodeSwap => "status-code-swap",
            OperatorKind::HeaderTamper => "header-tamper",
            OperatorKind::LatencyInjection => "latency-injection",
            OperatorKind::InvariantViolation => "invariant-violation",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no operator kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operator kind `{0}`")]
pub struct UnknownOperatorKind(pub String);

impl FromStr for OperatorKind {
    type Err = UnknownOperatorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('_', "-");
        OperatorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| UnknownOperatorKind(s.to_string()))
    }
}

/// Which half of an exchange an operator rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSide {
    /// Outbound request.
    Request,
    /// Inbound response.
    Response,
}

/// Address of one JSON field inside a request or response body.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldTarget {
    /// Request or response body.
    pub side: PayloadSide,
    /// Response status the field belongs to; `None` for request fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Property names from the body root down to the field.
    pub path: Vec<String>,
}

impl FieldTarget {
    /// Field in the request body.
    pub fn request(path: Vec<String>) -> Self {
        Self {
            side: PayloadSide::Request,
            status: None,
            path,
        }
    }

    /// Field in the body of a response with `status`.
    pub fn response(status: u16, path: Vec<String>) -> Self {
        Self {
            side: PayloadSide::Response,
            status: Some(status),
            path,
        }
    }

    /// Dotted field path, e.g. `customer.address.city`.
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }
}

impl fmt::Display for FieldTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.side, self.status) {
            (PayloadSide::Response, Some(status)) => write!(f, "response[{status}].{}", self.dotted()),
            (PayloadSide::Response, None) => write!(f, "response.{}", self.dotted()),
            (PayloadSide::Request, _) => write!(f, "request.{}", self.dotted()),
        }
    }
}

/// Where a boundary value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundSource {
    /// One past the declared `maximum` / `maxLength`.
    DeclaredMax,
    /// One below the declared `minimum` / `minLength`.
    DeclaredMin,
    /// No bound declared; a type extreme (0, -1 or the largest value) is used.
    TypeDefault,
}

/// Header rewrite performed by [`MutationOperator::HeaderTamper`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HeaderAction {
    /// Drop the header.
    Remove {
        /// Lower-cased header name.
        name: String,
    },
    /// Replace the header value (adding the header if missing).
    Replace {
        /// Lower-cased header name.
        name: String,
        /// New value.
        value: String,
    },
}

impl HeaderAction {
    fn name(&self) -> &str {
        match self {
            HeaderAction::Remove { name } | HeaderAction::Replace { name, .. } => name,
        }
    }
}

/// A mutation operator together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "kebab-case")]
pub enum MutationOperator {
    /// Remove the target field.
    FieldOmission {
        /// Field to remove.
        target: FieldTarget,
    },
    /// Set the target field to `null`.
    NullField {
        /// Field to null out.
        target: FieldTarget,
    },
    /// Replace a number or boolean with its string form.
    TypeCoercion {
        /// Field to coerce.
        target: FieldTarget,
    },
    /// Replace a string with `""`.
    EmptyString {
        /// Field to empty.
        target: FieldTarget,
    },
    /// Replace an array with `[]`.
    EmptyList {
        /// Field to empty.
        target: FieldTarget,
    },
    /// Replace the target field with an out-of-range value.
    BoundarySubstitution {
        /// Field to overwrite.
        target: FieldTarget,
        /// Replacement value.
        value: Value,
        /// Which bound produced the value.
        source: BoundSource,
    },
    /// Rewrite a response status.
    StatusCodeSwap {
        /// Success status that is replaced.
        from: u16,
        /// Error status returned instead.
        to: u16,
    },
    /// Remove or rewrite a header.
    HeaderTamper {
        /// Request or response headers.
        side: PayloadSide,
        /// Response status this applies to; `None` for requests.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        /// What to do with the header.
        action: HeaderAction,
    },
    /// Hold the response back before returning it.
    LatencyInjection {
        /// Added delay in milliseconds.
        delay_ms: u64,
    },
    /// Write a value that breaks a business-rule invariant.
    InvariantViolation {
        /// Field the rule constrains.
        target: FieldTarget,
        /// Rule name.
        rule: String,
        /// Precondition copied from the rule.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Condition>,
        /// The rule's requirement.
        require: Condition,
        /// Which breaking value to write.
        violation: Violation,
    },
}

/// A mutant's transformation could not be applied to an observed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutantApplicationError {
    /// The body is empty or not JSON.
    #[error("body is not JSON: {0}")]
    BodyNotJson(String),
    /// The addressed field is missing (or a parent is not an object).
    #[error("target field `{0}` is absent from the body")]
    FieldAbsent(String),
    /// The field holds a value the operator does not apply to.
    #[error("field `{field}` holds {found}, expected {expected}")]
    TypeMismatch {
        /// Dotted field path.
        field: String,
        /// What the operator needs.
        expected: &'static str,
        /// What was found.
        found: &'static str,
    },
    /// The header to remove is not on the message.
    #[error("target header `{0}` is absent")]
    HeaderAbsent(String),
    /// A violation references a field the body lacks, or cannot be offset.
    #[error("violation `{violation}` of `{field}` cannot be built from this body")]
    ViolationUnresolved {
        /// Dotted field path.
        field: String,
        /// Violation in display form.
        violation: String,
    },
    /// A failure reported back by a test process, carried as its message.
    #[error("{0}")]
    Reported(String),
}

impl MutationOperator {
    /// Operator kind.
    pub fn kind(&self) -> OperatorKind {
        match self {
            MutationOperator::FieldOmission { .. } => OperatorKind::FieldOmission,
            MutationOperator::NullField { .. } => OperatorKind::NullField,
            MutationOperator::TypeCoercion { .. } => OperatorKind::TypeCoercion,
            MutationOperator::EmptyString { .. } => OperatorKind::EmptyString,
            MutationOperator::EmptyList { .. } => OperatorKind::EmptyList,
            MutationOperator::BoundarySubstitution { .. } => OperatorKind::BoundarySubstitution,
            MutationOperator::StatusCodeSwap { .. } => OperatorKind::StatusCodeSwap,
            MutationOperator::HeaderTamper { .. } => OperatorKind::HeaderTamper,
            MutationOperator::LatencyInjection { .. } => OperatorKind::LatencyInjection,
            MutationOperator::InvariantViolation { .. } => OperatorKind::InvariantViolation,
        }
    }

    /// Side of the exchange this operator rewrites.
    pub fn side(&self) -> PayloadSide {
        match self {
            MutationOperator::HeaderTamper { side, .. } => *side,
            MutationOperator::StatusCodeSwap { .. } | MutationOperator::LatencyInjection { .. } => {
                PayloadSide::Response
            }
            other => other
                .field_target()
                .map_or(PayloadSide::Response, |target| target.side),
        }
    }

    /// Response status the operator is restricted to, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            MutationOperator::StatusCodeSwap { from, .. } => Some(*from),
            MutationOperator::HeaderTamper { status, .. } => *status,
            MutationOperator::LatencyInjection { .. } => None,
            other => other.field_target().and_then(|target| target.status),
        }
    }

    /// The targeted field, for field operators.
    pub fn field_target(&self) -> Option<&FieldTarget> {
        match self {
            MutationOperator::FieldOmission { target }
            | MutationOperator::NullField { target }
            | MutationOperator::TypeCoercion { target }
            | MutationOperator::EmptyString { target }
            | MutationOperator::EmptyList { target }
            | MutationOperator::BoundarySubstitution { target, .. }
            | MutationOperator::InvariantViolation { target, .. } => Some(target),
            _ => None,
        }
    }

    /// What the operator points at: a field, a status, a header or the whole response.
    pub fn target_label(&self) -> String {
        match self {
            MutationOperator::StatusCodeSwap { from, .. } => format!("status[{from}]"),
            MutationOperator::HeaderTamper {
                side,
                status,
                action,
            } => match (side, status) {
                (PayloadSide::Response, Some(status)) => {
                    format!("response[{status}].header.{}", action.name())
                }
                (PayloadSide::Response, None) => format!("response.header.{}", action.name()),
                (PayloadSide::Request, _) => format!("request.header.{}", action.name()),
            },
            MutationOperator::LatencyInjection { .. } => "response".to_string(),
            other => other
                .field_target()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }

    /// Operator parameter in display form; empty when the operator has none.
    pub fn parameter_label(&self) -> String {
        match self {
            MutationOperator::BoundarySubstitution { value, .. } => match value {
                Value::String(s) => format!("length {}", s.chars().count()),
                other => other.to_string(),
            },
            MutationOperator::StatusCodeSwap { to, .. } => to.to_string(),
            MutationOperator::HeaderTamper { action, .. } => match action {
                HeaderAction::Remove { .. } => "remove".to_string(),
                HeaderAction::Replace { value, .. } => format!("= {value}"),
            },
            MutationOperator::LatencyInjection { delay_ms } => format!("+{delay_ms}ms"),
            MutationOperator::InvariantViolation {
                rule, violation, ..
            } => format!("{rule}: {violation}"),
            _ => String::new(),
        }
    }

    /// Build the invariant operators for one rule; none when the rule's field
    /// addresses array items.
    pub fn invariant_violations(rule: &InvariantRule) -> Vec<MutationOperator> {
        let Some(path) = rule.require.path() else {
            return Vec::new();
        };
        let target = FieldTarget::response(rule.status, path);
        rule.require
            .violations()
            .into_iter()
            .map(|violation| MutationOperator::InvariantViolation {
                target: target.clone(),
                rule: rule.name.clone(),
                when: rule.when.clone(),
                require: rule.require.clone(),
                violation,
            })
            .collect()
    }

    /// Whether the operator has anything to show on this response.
    ///
    /// Invariant operators only apply where the precondition holds and the
    /// original body satisfies the rule; every other operator always applies.
    /// Bodies that are not JSON count as applicable so the failure surfaces.
    pub fn applies_to(&self, response: &HttpResponse) -> bool {
        let MutationOperator::InvariantViolation { when, require, .. } = self else {
            return true;
        };
        let Ok(document) = parse_body(&response.body) else {
            return true;
        };
        when.as_ref().is_none_or(|c| c.holds(&document)) && require.holds(&document)
    }

    /// Delay injected before a matched response is returned.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            MutationOperator::LatencyInjection { delay_ms } => {
                Some(Duration::from_millis(*delay_ms))
            }
            _ => None,
        }
    }

    /// Rewrite an outbound request. Response-side operators leave it untouched.
    pub fn apply_request(&self, request: &mut HttpRequest) -> Result<(), MutantApplicationError> {
        if self.side() != PayloadSide::Request {
            return Ok(());
        }
        match self {
            MutationOperator::HeaderTamper { action, .. } => {
                apply_header_action(&mut request.headers, action)
            }
            other => match other.field_target() {
                Some(target) => {
                    let body = other.edit_body(&request.body, target)?;
                    request.set_body(body);
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    /// Rewrite an inbound response. Request-side operators leave it untouched.
    ///
    /// Latency is not applied here; callers sleep for [`MutationOperator::delay`].
    pub fn apply_response(&self, response: &mut HttpResponse) -> Result<(), MutantApplicationError> {
        if self.side() != PayloadSide::Response {
            return Ok(());
        }
        match self {
            MutationOperator::StatusCodeSwap { from, to } => {
                if response.status == *from {
                    response.status = *to;
                }
                Ok(())
            }
            MutationOperator::HeaderTamper { action, .. } => {
                apply_header_action(&mut response.headers, action)
            }
            MutationOperator::LatencyInjection { .. } => Ok(()),
            MutationOperator::InvariantViolation {
                target, violation, ..
            } => {
                let body = write_violation(&response.body, target, violation)?;
                response.set_body(body);
                Ok(())
            }
            other => match other.field_target() {
                Some(target) => {
                    let body = other.edit_body(&response.body, target)?;
                    response.set_body(body);
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    fn edit_body(
        &self,
        body: &[u8],
        target: &FieldTarget,
    ) -> Result<Vec<u8>, MutantApplicationError> {
        let mut document = parse_body(body)?;

        let field = target.dotted();
        let Some((last, parents)) = target.path.split_last() else {
            return Err(MutantApplicationError::FieldAbsent(field));
        };
        let parent = descend(&mut document, parents)
            .ok_or_else(|| MutantApplicationError::FieldAbsent(field.clone()))?;

        if let MutationOperator::FieldOmission { .. } = self {
            if !parent.contains_key(last) {
                return Err(MutantApplicationError::FieldAbsent(field));
            }
            // Siblings keep their original order.
            *parent = std::mem::take(parent)
                .into_iter()
                .filter(|(key, _)| key != last)
                .collect();
        } else {
            let slot = parent
                .get_mut(last)
                .ok_or_else(|| MutantApplicationError::FieldAbsent(field.clone()))?;
            *slot = self.replacement(&field, slot)?;
        }

        serde_json::to_vec(&document).map_err(|e| MutantApplicationError::BodyNotJson(e.to_string()))
    }

    fn replacement(&self, field: &str, current: &Value) -> Result<Value, MutantApplicationError> {
        let mismatch = |expected| MutantApplicationError::TypeMismatch {
            field: field.to_string(),
            expected,
            found: json_kind(current),
        };
        match self {
            MutationOperator::NullField { .. } => Ok(Value::Null),
            MutationOperator::TypeCoercion { .. } => match current {
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(mismatch("a number or boolean")),
            },
            MutationOperator::EmptyString { .. } => match current {
                Value::String(_) => Ok(Value::String(String::new())),
                _ => Err(mismatch("a string")),
            },
            MutationOperator::EmptyList { .. } => match current {
                Value::Array(_) => Ok(Value::Array(Vec::new())),
                _ => Err(mismatch("an array")),
            },
            MutationOperator::BoundarySubstitution { value, .. } => Ok(value.clone()),
            _ => Ok(current.clone()),
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Value, MutantApplicationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(MutantApplicationError::BodyNotJson("body is empty".to_string()));
    }
    serde_json::from_slice(body).map_err(|e| MutantApplicationError::BodyNotJson(e.to_string()))
}

/// Set the target to the violating value, adding the field when its parent
/// object exists but the field does not.
fn write_violation(
    body: &[u8],
    target: &FieldTarget,
    violation: &Violation,
) -> Result<Vec<u8>, MutantApplicationError> {
    let mut document = parse_body(body)?;
    let field = target.dotted();
    let current = crate::invariant::lookup(&document, &field)
        .cloned()
        .unwrap_or(Value::Null);
    let value = violation.value(&document, &current).ok_or_else(|| {
        MutantApplicationError::ViolationUnresolved {
            field: field.clone(),
            violation: violation.to_string(),
        }
    })?;

    let Some((last, parents)) = target.path.split_last() else {
        return Err(MutantApplicationError::FieldAbsent(field));
    };
    let parent = descend(&mut document, parents)
        .ok_or_else(|| MutantApplicationError::FieldAbsent(field.clone()))?;
    parent.insert(last.clone(), value);

    serde_json::to_vec(&document).map_err(|e| MutantApplicationError::BodyNotJson(e.to_string()))
}

fn descend<'a>(root: &'a mut Value, parents: &[String]) -> Option<&'a mut Map<String, Value>> {
    let mut node = root;
    for segment in parents {
        node = node.as_object_mut()?.get_mut(segment)?;
    }
    node.as_object_mut()
}

fn apply_header_action(
    headers: &mut Vec<(String, String)>,
    action: &HeaderAction,
) -> Result<(), MutantApplicationError> {
    match action {
        HeaderAction::Remove { name } => {
            if remove_header(headers, name) {
                Ok(())
            } else {
                Err(MutantApplicationError::HeaderAbsent(name.clone()))
            }
        }
        HeaderAction::Replace { name, value } => {
            set_header(headers, name, value);
            Ok(())
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
