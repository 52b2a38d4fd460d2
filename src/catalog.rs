//! Mutant enumeration.
//!
//! Given the endpoint model, the catalog decides which operators apply where
//! and produces a deterministic, globally numbered mutant population. The same
//! schema and options always yield the same sequence, which is what makes
//! persisted runs resumable.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::intercept::path::path_matches_template;
use crate::invariant::InvariantRule;
use crate::operators::{
    BoundSource, FieldTarget, HeaderAction, MutationOperator, OperatorKind, PayloadSide,
};
use crate::schema::{BodyShape, EndpointDescriptor, FieldSchema, FieldType, Method};

/// Longest string a length-boundary mutant will generate.
pub const MAX_GENERATED_STRING_LEN: u64 = 1 << 20;

/// Default delay for latency mutants.
pub const DEFAULT_LATENCY_MS: u64 = 2_000;

/// Stable mutant identifier: the mutant's position in catalog order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MutantId(pub u32);

impl fmt::Display for MutantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{:04}", self.0)
    }
}

impl FromStr for MutantId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('m')
            .and_then(|digits| digits.parse().ok())
            .map(MutantId)
            .ok_or_else(|| format!("invalid mutant id `{s}`"))
    }
}

impl From<MutantId> for String {
    fn from(id: MutantId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MutantId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Method and path template identifying one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    /// HTTP method.
    pub method: Method,
    /// Path template.
    pub path: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

/// One operator bound to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutant {
    /// Catalog position.
    pub id: MutantId,
    /// Targeted endpoint.
    pub endpoint: EndpointKey,
    /// Transformation to apply.
    pub operator: MutationOperator,
}

impl Mutant {
    /// Operator kind.
    pub fn kind(&self) -> OperatorKind {
        self.operator.kind()
    }

    /// Applicability predicate over a call: same method and a path fitting the template.
    ///
    /// `path` must already be normalized.
    pub fn matches(&self, method: Method, path: &str) -> bool {
        self.endpoint.method == method && path_matches_template(&self.endpoint.path, path)
    }

    /// Whether a response with `status` is in scope for this mutant.
    pub fn matches_status(&self, status: u16) -> bool {
        self.operator.status().is_none_or(|wanted| wanted == status)
    }

    /// Human-readable description, e.g. `GET /orders/{id} null-field response[200].id`.
    pub fn label(&self) -> String {
        let mut label = format!("{} {} {}", self.endpoint, self.kind(), self.operator.target_label());
        let parameter = self.operator.parameter_label();
        if !parameter.is_empty() {
            label.push_str(" (");
            label.push_str(&parameter);
            label.push(')');
        }
        label
    }

    fn sort_key(&self) -> (&str, Method, OperatorKind, String, String) {
        (
            &self.endpoint.path,
            self.endpoint.method,
            self.kind(),
            self.operator.target_label(),
            self.operator.parameter_label(),
        )
    }
}

/// Knobs controlling which mutants are produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogOptions {
    /// Operator kinds to enumerate.
    pub enabled: BTreeSet<OperatorKind>,
    /// Delay used by latency mutants.
    pub latency_ms: u64,
    /// Whether request-body fields are mutated as well as response fields.
    pub include_request_fields: bool,
    /// Path-template prefixes whose endpoints are skipped.
    pub exclude_paths: Vec<String>,
    /// Business-rule invariants, each bound to one endpoint response.
    pub invariants: Vec<InvariantRule>,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            enabled: OperatorKind::ALL
                .into_iter()
                .filter(|kind| *kind != OperatorKind::LatencyInjection)
                .collect(),
            latency_ms: DEFAULT_LATENCY_MS,
            include_request_fields: true,
            exclude_paths: Vec::new(),
            invariants: Vec::new(),
        }
    }
}

impl CatalogOptions {
    /// Enable or disable one kind.
    pub fn with_kind(mut self, kind: OperatorKind, enabled: bool) -> Self {
        if enabled {
            self.enabled.insert(kind);
        } else {
            self.enabled.remove(&kind);
        }
        self
    }

    /// Enable only the given kinds.
    pub fn only(mut self, kinds: impl IntoIterator<Item = OperatorKind>) -> Self {
        self.enabled = kinds.into_iter().collect();
        self
    }

    /// Skip endpoints under a path prefix.
    pub fn excluding(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_paths.push(prefix.into());
        self
    }

    /// Add an invariant rule.
    pub fn with_invariant(mut self, rule: InvariantRule) -> Self {
        self.invariants.push(rule);
        self
    }

    /// True when `kind` is enabled.
    pub fn is_enabled(&self, kind: OperatorKind) -> bool {
        self.enabled.contains(&kind)
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Mutants for one endpoint, in catalog order and numbered from zero.
pub fn enumerate(endpoint: &EndpointDescriptor, options: &CatalogOptions) -> Vec<Mutant> {
    let mut mutants = endpoint_mutants(endpoint, options);
    sort_and_number(&mut mutants);
    mutants
}

/// Mutants for a whole API, in catalog order with globally unique ids.
pub fn enumerate_all(endpoints: &[EndpointDescriptor], options: &CatalogOptions) -> Vec<Mutant> {
    let mut mutants: Vec<Mutant> = endpoints
        .iter()
        .flat_map(|endpoint| endpoint_mutants(endpoint, options))
        .collect();
    sort_and_number(&mut mutants);
    mutants
}

fn sort_and_number(mutants: &mut [Mutant]) {
    mutants.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    for (index, mutant) in mutants.iter_mut().enumerate() {
        mutant.id = MutantId(index as u32);
    }
}

fn endpoint_mutants(endpoint: &EndpointDescriptor, options: &CatalogOptions) -> Vec<Mutant> {
    if options.is_excluded(&endpoint.path) {
        return Vec::new();
    }

    let key = EndpointKey {
        method: endpoint.method,
        path: endpoint.path.clone(),
    };
    let mut operators = Vec::new();

    if options.include_request_fields {
        for field in endpoint.request_fields() {
            field_operators(field, &[], PayloadSide::Request, None, options, &mut operators);
        }
    }

    let success: Vec<_> = endpoint
        .responses
        .values()
        .filter(|response| response.is_success())
        .collect();

    for response in &success {
        // Collection responses carry no addressable top-level fields.
        if let BodyShape::Object { fields } = &response.body {
            for field in fields {
                field_operators(
                    field,
                    &[],
                    PayloadSide::Response,
                    Some(response.status),
                    options,
                    &mut operators,
                );
            }
        }
    }

    if options.is_enabled(OperatorKind::StatusCodeSwap) {
        let error_status = endpoint
            .responses
            .keys()
            .copied()
            .find(|status| *status >= 400)
            .unwrap_or(500);
        for response in &success {
            operators.push(MutationOperator::StatusCodeSwap {
                from: response.status,
                to: error_status,
            });
        }
    }

    if options.is_enabled(OperatorKind::HeaderTamper) {
        for header in &endpoint.headers {
            operators.push(MutationOperator::HeaderTamper {
                side: PayloadSide::Request,
                status: None,
                action: HeaderAction::Remove {
                    name: header.name.clone(),
                },
            });
        }
        for response in success.iter().filter(|r| r.content_type.is_some()) {
            operators.push(MutationOperator::HeaderTamper {
                side: PayloadSide::Response,
                status: Some(response.status),
                action: HeaderAction::Replace {
                    name: "content-type".to_string(),
                    value: "text/plain".to_string(),
                },
            });
        }
    }

    if options.is_enabled(OperatorKind::LatencyInjection) {
        operators.push(MutationOperator::LatencyInjection {
            delay_ms: options.latency_ms,
        });
    }

    if options.is_enabled(OperatorKind::InvariantViolation) {
        let mut seen = BTreeSet::new();
        for rule in options
            .invariants
            .iter()
            .filter(|rule| rule.method == endpoint.method && rule.path == endpoint.path)
        {
            for operator in MutationOperator::invariant_violations(rule) {
                // Rules sharing a name collapse to one mutant per violation.
                if seen.insert((operator.target_label(), operator.parameter_label())) {
                    operators.push(operator);
                }
            }
        }
    }

    operators
        .into_iter()
        .map(|operator| Mutant {
            id: MutantId(0),
            endpoint: key.clone(),
            operator,
        })
        .collect()
}

fn field_operators(
    field: &FieldSchema,
    parent: &[String],
    side: PayloadSide,
    status: Option<u16>,
    options: &CatalogOptions,
    out: &mut Vec<MutationOperator>,
) {
    let mut path = parent.to_vec();
    path.push(field.name.clone());
    let target = FieldTarget {
        side,
        status,
        path: path.clone(),
    };

    if options.is_enabled(OperatorKind::FieldOmission) {
        out.push(MutationOperator::FieldOmission {
            target: target.clone(),
        });
    }
    if options.is_enabled(OperatorKind::NullField) {
        out.push(MutationOperator::NullField {
            target: target.clone(),
        });
    }
    let coercible = matches!(
        field.ty,
        FieldType::Integer | FieldType::Number | FieldType::Boolean
    );
    if coercible && options.is_enabled(OperatorKind::TypeCoercion) {
        out.push(MutationOperator::TypeCoercion {
            target: target.clone(),
        });
    }
    if field.ty == FieldType::String && options.is_enabled(OperatorKind::EmptyString) {
        out.push(MutationOperator::EmptyString {
            target: target.clone(),
        });
    }
    if field.ty == FieldType::Array && options.is_enabled(OperatorKind::EmptyList) {
        out.push(MutationOperator::EmptyList {
            target: target.clone(),
        });
    }
    if options.is_enabled(OperatorKind::BoundarySubstitution) {
        for (value, source) in boundary_values(field) {
            out.push(MutationOperator::BoundarySubstitution {
                target: target.clone(),
                value,
                source,
            });
        }
    }

    for child in &field.fields {
        field_operators(child, &path, side, status, options, out);
    }
}

/// Out-of-range replacement values for a field, without duplicates.
pub fn boundary_values(field: &FieldSchema) -> Vec<(Value, BoundSource)> {
    let constraints = &field.constraints;
    let mut values = Vec::new();

    match field.ty {
        FieldType::Integer | FieldType::Number => {
            let integer = field.ty == FieldType::Integer;
            match &constraints.maximum {
                Some(max) => {
                    if let Some(value) = step(max, 1, integer) {
                        values.push((value, BoundSource::DeclaredMax));
                    }
                }
                None => {
                    let extreme = if integer {
                        Value::from(i64::MAX)
                    } else {
                        Number::from_f64(f64::MAX).map_or(Value::Null, Value::Number)
                    };
                    values.push((extreme, BoundSource::TypeDefault));
                }
            }
            match &constraints.minimum {
                Some(min) => {
                    if let Some(value) = step(min, -1, integer) {
                        values.push((value, BoundSource::DeclaredMin));
                    }
                }
                None => {
                    values.push((Value::from(0), BoundSource::TypeDefault));
                    values.push((Value::from(-1), BoundSource::TypeDefault));
                }
            }
        }
        FieldType::String => {
            if let Some(max) = constraints.max_length {
                if max < MAX_GENERATED_STRING_LEN {
                    values.push((Value::String(filler(max + 1)), BoundSource::DeclaredMax));
                }
            }
            if let Some(min) = constraints.min_length.filter(|min| *min > 0) {
                if min <= MAX_GENERATED_STRING_LEN {
                    values.push((Value::String(filler(min - 1)), BoundSource::DeclaredMin));
                }
            }
        }
        _ => {}
    }

    let mut unique: Vec<(Value, BoundSource)> = Vec::with_capacity(values.len());
    for (value, source) in values {
        if !value.is_null() && !unique.iter().any(|(seen, _)| *seen == value) {
            unique.push((value, source));
        }
    }
    unique
}

/// `bound + delta`, or `None` when it does not fit the bound's type.
fn step(bound: &Number, delta: i64, integer: bool) -> Option<Value> {
    if let Some(i) = bound.as_i64() {
        return i.checked_add(delta).map(Value::from);
    }
    if let Some(u) = bound.as_u64() {
        return u.checked_add_signed(delta).map(Value::from);
    }
    let shifted = bound.as_f64()? + delta as f64;
    if integer {
        let rounded = if delta > 0 {
            shifted.floor()
        } else {
            shifted.ceil()
        };
        if rounded.is_finite() && rounded.abs() < i64::MAX as f64 {
            return Some(Value::from(rounded as i64));
        }
        return None;
    }
    Number::from_f64(shifted).map(Value::Number)
}

fn filler(len: u64) -> String {
    "a".repeat(len as usize)
}
