//! Business-rule invariants over response bodies.
//!
//! A rule states what a successful response must satisfy: `total` is never
//! negative, `status` is one of a few values, `shipped_at` is set whenever
//! `status` is `shipped`. Each rule yields the values that would break it;
//! the catalog turns those into [`MutationOperator::InvariantViolation`]
//! mutants, and a suite that asserts the rule kills them.
//!
//! Operands written as `$.field` refer to another field of the same body,
//! which is how relations between fields are expressed.
//!
//! [`MutationOperator::InvariantViolation`]: crate::operators::MutationOperator::InvariantViolation

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::schema::Method;

/// Prefix marking an operand as a reference to another body field.
pub const FIELD_REFERENCE: &str = "$.";

/// What a [`Condition`] requires of its field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    /// Equal to the operand.
    Equals(Value),
    /// Different from the operand.
    NotEquals(Value),
    /// Strictly greater than the operand.
    GreaterThan(Value),
    /// Greater than or equal to the operand.
    GreaterThanOrEqual(Value),
    /// Strictly less than the operand.
    LessThan(Value),
    /// Less than or equal to the operand.
    LessThanOrEqual(Value),
    /// One of the listed values.
    In(Vec<Value>),
    /// None of the listed values.
    NotIn(Vec<Value>),
    /// `null` (or absent) when `true`.
    IsNull(bool),
    /// Present and not `null` when `true`.
    IsNotNull(bool),
    /// `""`, `[]` or `{}` when `true`.
    IsEmpty(bool),
    /// Not `null` and not empty when `true`.
    IsNotEmpty(bool),
}

/// One field check, e.g. `{ field: total, greater_than: 0 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path of the checked field.
    pub field: String,
    /// The check itself.
    #[serde(flatten)]
    pub check: Check,
}

impl Condition {
    /// Condition on `field`.
    pub fn new(field: impl Into<String>, check: Check) -> Self {
        Self {
            field: field.into(),
            check,
        }
    }

    /// Property names of the checked field; `None` when it addresses array items.
    pub fn path(&self) -> Option<Vec<String>> {
        split_path(&self.field)
    }

    /// Whether `document` satisfies the condition.
    ///
    /// An absent field reads as `null`. Ordering checks fail when either side
    /// is not comparable, as does any check whose referenced operand is absent.
    pub fn holds(&self, document: &Value) -> bool {
        let value = lookup(document, &self.field).unwrap_or(&Value::Null);
        let operand = |raw: &Value| resolve(raw, document).cloned();
        match &self.check {
            Check::Equals(raw) => operand(raw).is_some_and(|want| same(value, &want)),
            Check::NotEquals(raw) => operand(raw).is_some_and(|want| !same(value, &want)),
            Check::GreaterThan(raw) => ordering(value, operand(raw)) == Some(Ordering::Greater),
            Check::GreaterThanOrEqual(raw) => matches!(
                ordering(value, operand(raw)),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Check::LessThan(raw) => ordering(value, operand(raw)) == Some(Ordering::Less),
            Check::LessThanOrEqual(raw) => matches!(
                ordering(value, operand(raw)),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Check::In(allowed) => allowed
                .iter()
                .filter_map(|raw| resolve(raw, document))
                .any(|want| same(value, want)),
            Check::NotIn(denied) => !denied
                .iter()
                .filter_map(|raw| resolve(raw, document))
                .any(|want| same(value, want)),
            Check::IsNull(expected) => value.is_null() == *expected,
            Check::IsNotNull(expected) => !value.is_null() == *expected,
            Check::IsEmpty(expected) => is_empty(value) == *expected,
            Check::IsNotEmpty(expected) => (!value.is_null() && !is_empty(value)) == *expected,
        }
    }

    /// Values that break the condition, strongest first.
    pub fn violations(&self) -> Vec<Violation> {
        match &self.check {
            Check::IsNull(true) | Check::IsNotNull(false) => vec![Violation::NonNull],
            Check::IsNull(false) | Check::IsNotNull(true) => vec![Violation::Null],
            Check::IsEmpty(true) | Check::IsNotEmpty(false) => vec![Violation::NonEmpty],
            Check::IsEmpty(false) | Check::IsNotEmpty(true) => vec![Violation::Empty],
            Check::Equals(operand) => vec![Violation::Differ(operand.clone())],
            Check::NotEquals(operand) => vec![Violation::Equal(operand.clone())],
            Check::GreaterThan(bound) => vec![
                Violation::Equal(bound.clone()),
                Violation::Offset {
                    bound: bound.clone(),
                    delta: -1,
                },
            ],
            Check::GreaterThanOrEqual(bound) => vec![Violation::Offset {
                bound: bound.clone(),
                delta: -1,
            }],
            Check::LessThan(bound) => vec![
                Violation::Equal(bound.clone()),
                Violation::Offset {
                    bound: bound.clone(),
                    delta: 1,
                },
            ],
            Check::LessThanOrEqual(bound) => vec![Violation::Offset {
                bound: bound.clone(),
                delta: 1,
            }],
            Check::In(allowed) => vec![Violation::Outside(allowed.clone())],
            Check::NotIn(denied) => denied
                .first()
                .map(|first| Violation::Equal(first.clone()))
                .into_iter()
                .collect(),
        }
    }
}

/// A value that breaks a [`Condition`], computed against the observed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "operand", rename_all = "snake_case")]
pub enum Violation {
    /// `null`.
    Null,
    /// A non-null placeholder.
    NonNull,
    /// The empty form of the current value (`""` for strings, `[]` otherwise).
    Empty,
    /// A non-empty placeholder.
    NonEmpty,
    /// Anything but the operand.
    Differ(Value),
    /// The operand itself.
    Equal(Value),
    /// The operand moved by `delta`.
    Offset {
        /// Number or string the offset starts from.
        bound: Value,
        /// Direction and size of the move.
        delta: i64,
    },
    /// A value outside the list.
    Outside(Vec<Value>),
}

impl Violation {
    /// The replacement value for a body, or `None` when a referenced field is
    /// absent or the operand cannot be offset.
    pub fn value(&self, document: &Value, current: &Value) -> Option<Value> {
        match self {
            Violation::Null => Some(Value::Null),
            Violation::NonNull => Some(Value::String("non_null_value".to_string())),
            Violation::Empty => Some(match current {
                Value::String(_) => Value::String(String::new()),
                Value::Object(_) => Value::Object(Default::default()),
                _ => Value::Array(Vec::new()),
            }),
            Violation::NonEmpty => Some(Value::String("non_empty_value".to_string())),
            Violation::Differ(raw) => resolve(raw, document).map(different_from),
            Violation::Equal(raw) => resolve(raw, document).cloned(),
            Violation::Offset { bound, delta } => {
                resolve(bound, document).and_then(|bound| offset(bound, *delta))
            }
            Violation::Outside(allowed) => {
                let allowed: Vec<&Value> =
                    allowed.iter().filter_map(|raw| resolve(raw, document)).collect();
                Some(outside(&allowed))
            }
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Null => f.write_str("null"),
            Violation::NonNull => f.write_str("non-null"),
            Violation::Empty => f.write_str("empty"),
            Violation::NonEmpty => f.write_str("non-empty"),
            Violation::Differ(operand) => write!(f, "!= {}", operand_label(operand)),
            Violation::Equal(operand) => write!(f, "= {}", operand_label(operand)),
            Violation::Offset { bound, delta } => {
                write!(f, "= {}{delta:+}", operand_label(bound))
            }
            Violation::Outside(allowed) => {
                let allowed: Vec<String> = allowed.iter().map(operand_label).collect();
                write!(f, "not in [{}]", allowed.join(", "))
            }
        }
    }
}

fn default_status() -> u16 {
    200
}

/// A named invariant attached to one endpoint response.
///
/// In configuration:
///
/// ```yaml
/// invariants:
///   - name: shipped-orders-have-a-date
///     method: GET
///     path: /orders/{id}
///     if: { field: status, equals: shipped }
///     then: { field: shipped_at, is_not_null: true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantRule {
    /// Name shown in mutant labels.
    pub name: String,
    /// Endpoint method.
    pub method: Method,
    /// Endpoint path template.
    pub path: String,
    /// Response status the rule covers.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Precondition; the rule is vacuous for bodies that fail it.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// What the body must satisfy.
    #[serde(rename = "then")]
    pub require: Condition,
}

impl InvariantRule {
    /// Unconditional rule over responses with status 200.
    pub fn new(
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        require: Condition,
    ) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            status: default_status(),
            when: None,
            require,
        }
    }

    /// Add a precondition.
    pub fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Restrict to another response status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Whether a violation of this rule can be shown on `document`: the
    /// precondition holds and the body currently satisfies the rule.
    pub fn is_live(&self, document: &Value) -> bool {
        self.when.as_ref().is_none_or(|c| c.holds(document)) && self.require.holds(document)
    }
}

/// Value at a dotted path; `$.` prefixes are accepted.
pub fn lookup<'a>(document: &'a Value, field: &str) -> Option<&'a Value> {
    let path = field.strip_prefix(FIELD_REFERENCE).unwrap_or(field);
    path.split('.')
        .try_fold(document, |node, segment| node.as_object()?.get(segment))
}

fn split_path(field: &str) -> Option<Vec<String>> {
    let path = field.strip_prefix(FIELD_REFERENCE).unwrap_or(field);
    if path.is_empty() || path.contains('[') {
        return None;
    }
    Some(path.split('.').map(str::to_string).collect())
}

/// The operand itself, or the referenced field when it is a `$.field` string.
fn resolve<'a>(operand: &'a Value, document: &'a Value) -> Option<&'a Value> {
    match operand.as_str().and_then(|s| s.strip_prefix(FIELD_REFERENCE)) {
        Some(field) => lookup(document, field),
        None => Some(operand),
    }
}

fn operand_label(operand: &Value) -> String {
    match operand {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn same(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn ordering(left: &Value, right: Option<Value>) -> Option<Ordering> {
    let right = right?;
    match (left, &right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn different_from(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(format!("{s}_INVALID")),
        Value::Number(n) => offset(value, 999).unwrap_or_else(|| Value::Number(n.clone())),
        Value::Bool(b) => Value::Bool(!b),
        Value::Null => Value::String("non_null".to_string()),
        _ => Value::String("DIFFERENT_VALUE".to_string()),
    }
}

fn offset(bound: &Value, delta: i64) -> Option<Value> {
    match bound {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.checked_add(delta).map(Value::from),
            None => Number::from_f64(n.as_f64()? + delta as f64).map(Value::Number),
        },
        Value::String(s) if delta > 0 => Some(Value::String(format!("{s}Z"))),
        Value::String(s) => {
            let mut lower = s.clone();
            lower.pop()?;
            Some(Value::String(lower))
        }
        _ => None,
    }
}

fn outside(allowed: &[&Value]) -> Value {
    let numbers: Vec<f64> = allowed.iter().filter_map(|v| v.as_f64()).collect();
    if !numbers.is_empty() && numbers.len() == allowed.len() {
        let integers: Vec<i64> = allowed.iter().filter_map(|v| v.as_i64()).collect();
        if integers.len() == allowed.len() {
            let max = integers.into_iter().max().unwrap_or(0);
            return Value::from(max.saturating_add(999));
        }
        let max = numbers.into_iter().fold(f64::MIN, f64::max);
        if let Some(n) = Number::from_f64(max + 999.0) {
            return Value::Number(n);
        }
    }
    let mut candidate = "INVALID_VALUE".to_string();
    while allowed.iter().any(|v| v.as_str() == Some(candidate.as_str())) {
        candidate.push('_');
    }
    Value::String(candidate)
}
