use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use apimutant::intercept::{HttpRequest, HttpResponse, Transport, TransportError};
use apimutant::mutation::{
    Outcome, Scheduler, SuiteOutcome, TestInvocationError, summarize,
};
use apimutant::operators::{MutationOperator, OperatorKind};
use apimutant::schema::{Method, load_str};
use apimutant::{CatalogOptions, InterceptedTransport, InterceptionContext, Mutant, enumerate_all};

const ORDERS_API: &str = r#"
openapi: 3.0.3
info:
  title: orders
  version: "1"
paths:
  /orders:
    post:
      requestBody:
        content:
          application/json:
            schema:
              type: object
              required: [symbol, quantity]
              properties:
                symbol:
                  type: string
                quantity:
                  type: integer
                  minimum: 1
                  maximum: 100
      responses:
        201:
          description: created
          content:
            application/json:
              schema:
                type: object
                properties:
                  id:
                    type: string
                  status:
                    type: string
        400:
          description: invalid order
  /orders/{id}:
    get:
      responses:
        200:
          description: found
          content:
            application/json:
              schema:
                type: object
                properties:
                  id:
                    type: string
                  symbol:
                    type: string
                  quantity:
                    type: integer
        404:
          description: unknown order
"#;

/// In-memory orders service behind the transport seam.
#[derive(Default)]
struct OrdersApi {
    orders: Mutex<BTreeMap<String, Value>>,
}

impl OrdersApi {
    fn handle(&self, request: HttpRequest) -> HttpResponse {
        let path = request.path();
        let mut orders = self.orders.lock().expect("orders lock");
        match (request.method, path.as_str()) {
            (Method::Post, "/orders") => {
                let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
                let symbol = body["symbol"].as_str().filter(|s| !s.is_empty());
                let quantity = body["quantity"]
                    .as_i64()
                    .filter(|q| (1..=100).contains(q));
                match (symbol, quantity) {
                    (Some(symbol), Some(quantity)) => {
                        let id = format!("o-{}", orders.len() + 1);
                        orders.insert(
                            id.clone(),
                            json!({ "id": id, "symbol": symbol, "quantity": quantity }),
                        );
                        HttpResponse::new(201).with_json(&json!({ "id": id, "status": "open" }))
                    }
                    _ => HttpResponse::new(400).with_json(&json!({ "error": "invalid order" })),
                }
            }
            (Method::Get, path) => match path
                .strip_prefix("/orders/")
                .and_then(|id| orders.get(id).cloned())
            {
                Some(order) => HttpResponse::new(200).with_json(&order),
                None => HttpResponse::new(404),
            },
            _ => HttpResponse::new(404),
        }
    }
}

fn server(api: Arc<OrdersApi>) -> impl Transport {
    move |request: HttpRequest| Ok::<_, TransportError>(api.handle(request))
}

/// The suite under evaluation: create, fetch, reject.
fn orders_suite(context: &InterceptionContext) -> Result<SuiteOutcome, TestInvocationError> {
    let client = InterceptedTransport::new(
        server(Arc::new(OrdersApi::default())),
        Some(context.clone()),
    );
    let send = |request: HttpRequest| {
        client
            .send(request)
            .map_err(|e| TestInvocationError::Other(e.to_string()))
    };
    let mut failures = Vec::new();

    let created = send(
        HttpRequest::new(Method::Post, "http://orders.test/orders")
            .with_json(&json!({ "symbol": "ABC", "quantity": 5 })),
    )?;
    let created_body = created.json().unwrap_or(Value::Null);
    if created.status != 201 {
        failures.push("create: expected 201");
    }
    if created_body["status"] != "open" {
        failures.push("create: expected open status");
    }

    match created_body["id"].as_str().filter(|id| !id.is_empty()) {
        Some(id) => {
            let fetched = send(HttpRequest::new(
                Method::Get,
                format!("http://orders.test/orders/{id}"),
            ))?;
            let order = fetched.json().unwrap_or(Value::Null);
            if fetched.status != 200 {
                failures.push("fetch: expected 200");
            }
            if order["symbol"] != "ABC" || order["quantity"] != 5 {
                failures.push("fetch: order fields");
            }
        }
        None => failures.push("create: missing id"),
    }

    let rejected = send(
        HttpRequest::new(Method::Post, "http://orders.test/orders")
            .with_json(&json!({ "symbol": "ABC", "quantity": 0 })),
    )?;
    if rejected.status != 400 {
        failures.push("reject: expected 400");
    }

    Ok(if failures.is_empty() {
        SuiteOutcome::passed()
    } else {
        SuiteOutcome::failed(failures)
    })
}

fn catalog() -> Vec<Mutant> {
    let endpoints = load_str(ORDERS_API).expect("orders schema should load");
    enumerate_all(&endpoints, &CatalogOptions::default())
}

#[test]
fn scheduler_classifies_mutants_against_the_orders_suite() {
    let mutants = catalog();
    assert!(!mutants.is_empty());

    let scheduler = Scheduler::new(InterceptionContext::new());
    let run = scheduler
        .run(&mutants, &orders_suite)
        .expect("baseline should pass and the run should finish");
    assert!(!run.interrupted);
    assert_eq!(run.results.len(), mutants.len());
    assert!(!scheduler.context().is_armed());

    let outcome_of = |kind: OperatorKind, method: Method, target: &str| {
        run.results
            .iter()
            .find(|r| r.operator == kind && r.endpoint.method == method && r.label.contains(target))
            .unwrap_or_else(|| panic!("no {kind} mutant for {method} {target}"))
    };

    assert_eq!(
        outcome_of(OperatorKind::StatusCodeSwap, Method::Post, "status[201]").outcome,
        Outcome::Killed
    );
    assert_eq!(
        outcome_of(OperatorKind::FieldOmission, Method::Post, "request.quantity").outcome,
        Outcome::Killed
    );
    assert_eq!(
        outcome_of(OperatorKind::EmptyString, Method::Post, "request.symbol").outcome,
        Outcome::Killed
    );
    assert_eq!(
        outcome_of(OperatorKind::HeaderTamper, Method::Get, "content-type").outcome,
        Outcome::Survived
    );

    let unchecked_id = outcome_of(OperatorKind::NullField, Method::Get, "response[200].id");
    assert_eq!(unchecked_id.outcome, Outcome::Survived);
    assert_eq!(unchecked_id.matched_calls, 1);
    assert_eq!(unchecked_id.applied, 1);

    let report = summarize(&run.results);
    assert_eq!(report.total, mutants.len());
    assert_eq!(report.errored, 0);
    assert_eq!(report.killed + report.survived, mutants.len());
    let score = report.score.expect("judged mutants give a score");
    assert!(score > 0.0 && score < 1.0);

    let value = serde_json::to_value(&report).expect("report should serialize");
    for key in ["total", "killed", "survived", "errored", "score", "byOperator"] {
        assert!(value.get(key).is_some(), "report JSON should carry `{key}`");
    }
}

#[test]
fn catalog_is_stable_across_enumerations() {
    assert_eq!(catalog(), catalog());
}

#[test]
fn boundary_mutant_changes_only_the_targeted_field() {
    let boundary = catalog()
        .into_iter()
        .find(|m| {
            matches!(
                &m.operator,
                MutationOperator::BoundarySubstitution { value, .. } if *value == json!(101)
            )
        })
        .expect("maximum 100 should yield a 101 boundary mutant");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        move |request: HttpRequest| {
            seen.lock().expect("seen lock").push(request.body.clone());
            Ok::<_, TransportError>(HttpResponse::new(400))
        }
    };
    let context = InterceptionContext::new();
    let client = InterceptedTransport::new(recorder, Some(context.clone()));
    context.arm(boundary).expect("arm");

    client
        .send(
            HttpRequest::new(Method::Post, "/orders")
                .with_json(&json!({ "symbol": "ABC", "quantity": 5 })),
        )
        .expect("send");
    let report = context.disarm().expect("mutant was armed");
    assert_eq!(report.applied, 1);

    let seen = seen.lock().expect("seen lock");
    let body: Value = serde_json::from_slice(&seen[0]).expect("body should stay json");
    assert_eq!(body, json!({ "symbol": "ABC", "quantity": 101 }));
}

#[test]
fn schema_without_mutable_surface_yields_an_empty_report() {
    let endpoints = load_str(
        "openapi: 3.1.0\npaths:\n  /health:\n    get:\n      responses:\n        default:\n          description: ok\n",
    )
    .expect("schema should load");
    let mutants = enumerate_all(&endpoints, &CatalogOptions::default());
    assert!(mutants.is_empty());

    let calls = Mutex::new(0);
    let runner = |_: &InterceptionContext| -> Result<SuiteOutcome, TestInvocationError> {
        *calls.lock().expect("calls lock") += 1;
        Ok(SuiteOutcome::passed())
    };
    let run = Scheduler::new(InterceptionContext::new())
        .run(&mutants, &runner)
        .expect("empty run should succeed");
    assert!(run.results.is_empty());
    assert_eq!(*calls.lock().expect("calls lock"), 0);

    let report = summarize(&run.results);
    assert_eq!(report.total, 0);
    assert_eq!(report.score, None);
    assert_eq!(
        serde_json::to_value(&report).expect("serialize")["score"],
        Value::Null
    );
}

#[test]
fn activation_flag_controls_interception_in_test_processes() {
    let mutant = catalog()
        .into_iter()
        .find(|m| m.kind() == OperatorKind::StatusCodeSwap && m.endpoint.method == Method::Post)
        .expect("status swap mutant");
    let payload = serde_json::to_string(&mutant).expect("mutant should serialize");

    let inactive = InterceptionContext::from_vars(None, Some(&payload)).expect("valid vars");
    assert!(inactive.is_none());
    let off = InterceptionContext::from_vars(Some("0"), Some(&payload)).expect("valid vars");
    assert!(off.is_none());

    let request = HttpRequest::new(Method::Post, "/orders")
        .with_json(&json!({ "symbol": "ABC", "quantity": 5 }));
    let passthrough = InterceptedTransport::new(server(Arc::new(OrdersApi::default())), inactive);
    assert_eq!(passthrough.send(request.clone()).expect("send").status, 201);

    let armed = InterceptionContext::from_vars(Some("1"), Some(&payload))
        .expect("valid vars")
        .expect("flag is on");
    assert_eq!(armed.armed().map(|m| m.id), Some(mutant.id));
    let intercepted = InterceptedTransport::new(server(Arc::new(OrdersApi::default())), Some(armed));
    assert_eq!(intercepted.send(request).expect("send").status, 400);
}
