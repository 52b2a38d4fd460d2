//! OpenAPI 3.x document loading into an immutable endpoint model.
//!
//! Only the parts of the document that drive mutant enumeration are kept:
//! path templates, methods, JSON body shapes, declared header parameters and
//! per-status response bodies. References are resolved locally (`#/...`) with
//! an explicit reference stack, so cyclic type definitions are reported as
//! [`SchemaParseError::CyclicReference`] instead of recursing forever.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum schema nesting (objects, array items and reference hops) followed for one field.
pub const MAX_SCHEMA_DEPTH: usize = 32;

/// Schema loading errors. All of them are fatal for a mutation run.
#[derive(Debug, Error)]
pub enum SchemaParseError {
    /// The document could not be read.
    #[error("failed to read schema document: {0}")]
    Io(#[from] std::io::Error),
    /// The document is neither JSON nor YAML.
    #[error("schema document is not valid JSON or YAML: {0}")]
    Syntax(String),
    /// The document is not an OpenAPI 3.x description.
    #[error("unknown schema format: {0}")]
    UnknownFormat(String),
    /// A required part of the document has the wrong shape.
    #[error("malformed schema at {location}: {reason}")]
    Malformed {
        /// Where in the document the problem was found.
        location: String,
        /// What was wrong.
        reason: String,
    },
    /// A `$ref` points nowhere (or somewhere outside the document).
    #[error("unresolved schema reference `{reference}`: {reason}")]
    UnresolvedReference {
        /// The raw reference string.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },
    /// A type refers back to itself through a chain of references.
    #[error("cyclic schema reference: {chain}")]
    CyclicReference {
        /// The reference chain, ending with the repeated reference.
        chain: String,
    },
    /// Nesting went deeper than [`MAX_SCHEMA_DEPTH`].
    #[error("schema nesting exceeds {limit} levels at {location}")]
    DepthExceeded {
        /// Field path where the limit was hit.
        location: String,
        /// The configured limit.
        limit: usize,
    },
}

/// HTTP methods an OpenAPI path item can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `PUT`
    Put,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
    /// `OPTIONS`
    Options,
    /// `HEAD`
    Head,
    /// `PATCH`
    Patch,
    /// `TRACE`
    Trace,
}

impl Method {
    /// Every method, in path-item declaration order.
    pub const ALL: [Method; 8] = [
        Method::Get,
        Method::Put,
        Method::Post,
        Method::Delete,
        Method::Options,
        Method::Head,
        Method::Patch,
        Method::Trace,
    ];

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not an HTTP method.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown HTTP method `{0}`")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|method| method.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

/// JSON type of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// `string`
    String,
    /// `integer`
    Integer,
    /// `number`
    Number,
    /// `boolean`
    Boolean,
    /// `array`
    Array,
    /// `object`
    Object,
    /// No `type` given and nothing to infer it from.
    Unspecified,
}

impl FieldType {
    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "string" => FieldType::String,
            "integer" => FieldType::Integer,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            _ => FieldType::Unspecified,
        }
    }
}

/// Declared validation constraints the boundary operator reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// `minimum`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<Number>,
    /// `maximum`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<Number>,
    /// `minLength`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,
    /// `maxLength`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,
}

/// One named property of an object schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Property name.
    pub name: String,
    /// JSON type.
    pub ty: FieldType,
    /// Listed in the parent's `required`.
    pub required: bool,
    /// `nullable: true` or a `null` member in a type list.
    pub nullable: bool,
    /// Declared constraints.
    pub constraints: Constraints,
    /// Properties, for object fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
    /// Item schema, for array fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
}

/// Shape of a request or response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum BodyShape {
    /// No body declared.
    #[default]
    None,
    /// A JSON object with named properties.
    Object {
        /// Top-level properties.
        fields: Vec<FieldSchema>,
    },
    /// A JSON array (collection response).
    Array {
        /// Item schema.
        items: Box<FieldSchema>,
    },
    /// A bare scalar body.
    Scalar {
        /// Scalar type.
        ty: FieldType,
    },
}

impl BodyShape {
    /// Top-level properties; empty unless the body is an object.
    pub fn fields(&self) -> &[FieldSchema] {
        match self {
            BodyShape::Object { fields } => fields,
            _ => &[],
        }
    }
}

/// Declared response for one status code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// HTTP status code.
    pub status: u16,
    /// Media type of the declared content, if any.
    pub content_type: Option<String>,
    /// Body shape.
    pub body: BodyShape,
}

impl ResponseSchema {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A header parameter declared on an operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeaderParam {
    /// Lower-cased header name.
    pub name: String,
    /// Whether the operation requires it.
    pub required: bool,
}

/// One operation (path template + method) of the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Path template, e.g. `/orders/{id}`.
    pub path: String,
    /// HTTP method.
    pub method: Method,
    /// `operationId`, when declared.
    pub operation_id: Option<String>,
    /// Media type of the request body, if any.
    pub request_content_type: Option<String>,
    /// Request body shape.
    pub request_body: BodyShape,
    /// Declared header parameters, sorted by name.
    pub headers: Vec<HeaderParam>,
    /// Declared responses keyed by status code.
    pub responses: BTreeMap<u16, ResponseSchema>,
}

impl EndpointDescriptor {
    /// `METHOD /path` label.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Request body properties; empty unless the body is an object.
    pub fn request_fields(&self) -> &[FieldSchema] {
        self.request_body.fields()
    }
}

/// Read and load a document from disk.
pub fn load_path(path: &Path) -> Result<Vec<EndpointDescriptor>, SchemaParseError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

/// Load a JSON or YAML document.
pub fn load_str(text: &str) -> Result<Vec<EndpointDescriptor>, SchemaParseError> {
    let document = if text.trim_start().starts_with('{') {
        serde_json::from_str(text).map_err(|e| SchemaParseError::Syntax(e.to_string()))?
    } else {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| SchemaParseError::Syntax(e.to_string()))?;
        yaml_to_json(yaml)?
    };
    load_value(&document)
}

/// Load an already-parsed document.
pub fn load_value(document: &Value) -> Result<Vec<EndpointDescriptor>, SchemaParseError> {
    let root = document.as_object().ok_or_else(|| {
        SchemaParseError::UnknownFormat("document root is not a mapping".to_string())
    })?;

    match root.get("openapi").and_then(Value::as_str) {
        Some(version) if version.starts_with("3.") => {}
        Some(version) => {
            return Err(SchemaParseError::UnknownFormat(format!(
                "unsupported openapi version `{version}`"
            )));
        }
        None if root.contains_key("swagger") => {
            return Err(SchemaParseError::UnknownFormat(
                "swagger 2.0 documents are not supported".to_string(),
            ));
        }
        None => {
            return Err(SchemaParseError::UnknownFormat(
                "missing `openapi` version field".to_string(),
            ));
        }
    }

    let paths = root
        .get("paths")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("#/paths", "missing `paths` mapping"))?;

    let resolver = Resolver { document };
    let mut endpoints = Vec::new();
    for (path, item) in paths {
        let mut stack = Vec::new();
        let item = resolver.enter(item, &mut stack)?;
        let item = item
            .as_object()
            .ok_or_else(|| malformed(&format!("paths.{path}"), "path item is not a mapping"))?;
        let shared_params = item.get("parameters");

        for method in Method::ALL {
            let key = method.as_str().to_ascii_lowercase();
            if let Some(operation) = item.get(&key) {
                endpoints.push(resolver.endpoint(path, method, operation, shared_params)?);
            }
        }
    }

    endpoints.sort_by(|a, b| (&a.path, a.method).cmp(&(&b.path, b.method)));
    Ok(endpoints)
}

fn malformed(location: &str, reason: &str) -> SchemaParseError {
    SchemaParseError::Malformed {
        location: location.to_string(),
        reason: reason.to_string(),
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<Value, SchemaParseError> {
    Ok(match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        serde_yaml::Value::Mapping(mapping) => {
            let mut out = Map::new();
            for (key, value) in mapping {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => {
                        return Err(SchemaParseError::Syntax(format!(
                            "unsupported mapping key {other:?}"
                        )));
                    }
                };
                out.insert(key, yaml_to_json(value)?);
            }
            Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value)?,
    })
}

struct Resolver<'a> {
    document: &'a Value,
}

impl<'a> Resolver<'a> {
    fn lookup(&self, reference: &str) -> Result<&'a Value, SchemaParseError> {
        let pointer =
            reference
                .strip_prefix('#')
                .ok_or_else(|| SchemaParseError::UnresolvedReference {
                    reference: reference.to_string(),
                    reason: "only local `#/...` references are supported".to_string(),
                })?;
        self.document
            .pointer(pointer)
            .ok_or_else(|| SchemaParseError::UnresolvedReference {
                reference: reference.to_string(),
                reason: "no such location in the document".to_string(),
            })
    }

    /// Follow `$ref` hops, pushing each onto `stack`. Callers truncate the
    /// stack back to its previous length once the node is fully expanded.
    fn enter(
        &self,
        mut node: &'a Value,
        stack: &mut Vec<String>,
    ) -> Result<&'a Value, SchemaParseError> {
        while let Some(reference) = node.get("$ref").and_then(Value::as_str) {
            if stack.iter().any(|seen| seen == reference) {
                let mut chain = stack.clone();
                chain.push(reference.to_string());
                return Err(SchemaParseError::CyclicReference {
                    chain: chain.join(" -> "),
                });
            }
            if stack.len() >= MAX_SCHEMA_DEPTH {
                return Err(SchemaParseError::DepthExceeded {
                    location: reference.to_string(),
                    limit: MAX_SCHEMA_DEPTH,
                });
            }
            stack.push(reference.to_string());
            node = self.lookup(reference)?;
        }
        Ok(node)
    }

    fn endpoint(
        &self,
        path: &str,
        method: Method,
        operation: &'a Value,
        shared_params: Option<&'a Value>,
    ) -> Result<EndpointDescriptor, SchemaParseError> {
        let location = format!("{method} {path}");
        let mut stack = Vec::new();
        let operation = self.enter(operation, &mut stack)?;
        if !operation.is_object() {
            return Err(malformed(&location, "operation is not a mapping"));
        }

        let headers = self.headers(&location, shared_params, operation.get("parameters"))?;

        let (request_content_type, request_body) = match operation.get("requestBody") {
            Some(body) => {
                let mut stack = Vec::new();
                let body = self.enter(body, &mut stack)?;
                self.content(&format!("{location} request"), body.get("content"), &mut stack)?
            }
            None => (None, BodyShape::None),
        };

        let mut responses = BTreeMap::new();
        if let Some(declared) = operation.get("responses").and_then(Value::as_object) {
            for (code, response) in declared {
                // `default`, `2XX` and friends carry no concrete status to match on.
                let status = match code.parse::<u16>() {
                    Ok(status) if (100..=599).contains(&status) => status,
                    _ => continue,
                };
                let mut stack = Vec::new();
                let response = self.enter(response, &mut stack)?;
                let (content_type, body) = self.content(
                    &format!("{location} response {status}"),
                    response.get("content"),
                    &mut stack,
                )?;
                responses.insert(
                    status,
                    ResponseSchema {
                        status,
                        content_type,
                        body,
                    },
                );
            }
        }

        Ok(EndpointDescriptor {
            path: path.to_string(),
            method,
            operation_id: operation
                .get("operationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            request_content_type,
            request_body,
            headers,
            responses,
        })
    }

    fn headers(
        &self,
        location: &str,
        shared: Option<&'a Value>,
        own: Option<&'a Value>,
    ) -> Result<Vec<HeaderParam>, SchemaParseError> {
        let mut headers: BTreeMap<String, bool> = BTreeMap::new();
        // Operation-level parameters override path-level ones with the same name.
        for list in [shared, own].into_iter().flatten() {
            let list = list
                .as_array()
                .ok_or_else(|| malformed(location, "`parameters` is not a list"))?;
            for param in list {
                let mut stack = Vec::new();
                let param = self.enter(param, &mut stack)?;
                if param.get("in").and_then(Value::as_str) != Some("header") {
                    continue;
                }
                let name = param
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(location, "header parameter without a name"))?;
                let required = param
                    .get("required")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                headers.insert(name.to_ascii_lowercase(), required);
            }
        }
        Ok(headers
            .into_iter()
            .map(|(name, required)| HeaderParam { name, required })
            .collect())
    }

    fn content(
        &self,
        location: &str,
        content: Option<&'a Value>,
        stack: &mut Vec<String>,
    ) -> Result<(Option<String>, BodyShape), SchemaParseError> {
        let Some(content) = content.and_then(Value::as_object) else {
            return Ok((None, BodyShape::None));
        };
        let chosen = content
            .iter()
            .find(|(media, _)| media.contains("json"))
            .or_else(|| content.iter().next());
        let Some((media, media_object)) = chosen else {
            return Ok((None, BodyShape::None));
        };

        let shape = match media_object.get("schema") {
            Some(schema) => self.body(location, schema, stack)?,
            None => BodyShape::None,
        };
        Ok((Some(media.clone()), shape))
    }

    fn body(
        &self,
        location: &str,
        schema: &'a Value,
        stack: &mut Vec<String>,
    ) -> Result<BodyShape, SchemaParseError> {
        let mark = stack.len();
        let schema = self.enter(schema, stack)?;
        let (ty, _) = field_type(schema);
        let shape = match ty {
            FieldType::Object => BodyShape::Object {
                fields: self.object_fields(location, schema, 1, stack)?,
            },
            FieldType::Array => {
                let items = schema.get("items").unwrap_or(&Value::Null);
                BodyShape::Array {
                    items: Box::new(self.field(location, "items", items, true, 1, stack)?),
                }
            }
            ty => BodyShape::Scalar { ty },
        };
        stack.truncate(mark);
        Ok(shape)
    }

    fn field(
        &self,
        location: &str,
        name: &str,
        schema: &'a Value,
        required: bool,
        depth: usize,
        stack: &mut Vec<String>,
    ) -> Result<FieldSchema, SchemaParseError> {
        let location = format!("{location}.{name}");
        if depth > MAX_SCHEMA_DEPTH {
            return Err(SchemaParseError::DepthExceeded {
                location,
                limit: MAX_SCHEMA_DEPTH,
            });
        }

        let mark = stack.len();
        let schema = self.enter(schema, stack)?;
        let (ty, nullable) = field_type(schema);

        let fields = if ty == FieldType::Object {
            self.object_fields(&location, schema, depth + 1, stack)?
        } else {
            Vec::new()
        };
        let items = match (ty, schema.get("items")) {
            (FieldType::Array, Some(items)) => Some(Box::new(self.field(
                &location,
                "items",
                items,
                true,
                depth + 1,
                stack,
            )?)),
            _ => None,
        };
        stack.truncate(mark);

        Ok(FieldSchema {
            name: name.to_string(),
            ty,
            required,
            nullable,
            constraints: constraints(schema),
            fields,
            items,
        })
    }

    fn object_fields(
        &self,
        location: &str,
        schema: &'a Value,
        depth: usize,
        stack: &mut Vec<String>,
    ) -> Result<Vec<FieldSchema>, SchemaParseError> {
        let mut properties: Vec<(String, &'a Value)> = Vec::new();
        let mut required = BTreeSet::new();
        self.collect_properties(location, schema, depth, stack, &mut properties, &mut required)?;

        properties
            .into_iter()
            .map(|(name, property)| {
                let is_required = required.contains(&name);
                self.field(location, &name, property, is_required, depth, stack)
            })
            .collect()
    }

    fn collect_properties(
        &self,
        location: &str,
        schema: &'a Value,
        depth: usize,
        stack: &mut Vec<String>,
        properties: &mut Vec<(String, &'a Value)>,
        required: &mut BTreeSet<String>,
    ) -> Result<(), SchemaParseError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(SchemaParseError::DepthExceeded {
                location: location.to_string(),
                limit: MAX_SCHEMA_DEPTH,
            });
        }

        if let Some(members) = schema.get("allOf").and_then(Value::as_array) {
            for member in members {
                let mark = stack.len();
                let member = self.enter(member, stack)?;
                self.collect_properties(location, member, depth + 1, stack, properties, required)?;
                stack.truncate(mark);
            }
        }

        if let Some(own) = schema.get("properties").and_then(Value::as_object) {
            for (name, property) in own {
                match properties.iter_mut().find(|(existing, _)| existing == name) {
                    Some(slot) => slot.1 = property,
                    None => properties.push((name.clone(), property)),
                }
            }
        }
        if let Some(names) = schema.get("required").and_then(Value::as_array) {
            required.extend(names.iter().filter_map(Value::as_str).map(str::to_string));
        }
        Ok(())
    }
}

fn field_type(schema: &Value) -> (FieldType, bool) {
    let mut nullable = schema
        .get("nullable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let declared = match schema.get("type") {
        Some(Value::String(keyword)) => Some(FieldType::from_keyword(keyword)),
        Some(Value::Array(keywords)) => {
            let mut found = None;
            for keyword in keywords.iter().filter_map(Value::as_str) {
                if keyword == "null" {
                    nullable = true;
                } else if found.is_none() {
                    found = Some(FieldType::from_keyword(keyword));
                }
            }
            found
        }
        _ => None,
    };

    let ty = declared.unwrap_or_else(|| {
        if schema.get("properties").is_some() || schema.get("allOf").is_some() {
            FieldType::Object
        } else if schema.get("items").is_some() {
            FieldType::Array
        } else {
            FieldType::Unspecified
        }
    });
    (ty, nullable)
}

fn constraints(schema: &Value) -> Constraints {
    let number = |key: &str| match schema.get(key) {
        Some(Value::Number(n)) => Some(n.clone()),
        _ => None,
    };
    Constraints {
        minimum: number("minimum"),
        maximum: number("maximum"),
        min_length: schema.get("minLength").and_then(Value::as_u64),
        max_length: schema.get("maxLength").and_then(Value::as_u64),
    }
}
