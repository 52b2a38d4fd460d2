//! # apimutant
//!
//! `apimutant` measures how well a REST API test suite detects faults in the
//! traffic it exercises. It is organized around:
//! - `schema`: OpenAPI 3.x loading into an immutable endpoint model
//! - `invariant`: business-rule conditions over response bodies and the values that break them
//! - `operators`: the closed set of mutation operators and how each rewrites a payload
//! - `catalog`: deterministic enumeration of mutants for an API
//! - `intercept`: the arm/disarm context and the transport middleware that applies the armed mutant
//! - `mutation`: scheduling, resumable run persistence and score reporting
//!
//! The HTTP client of the suite under test is out of scope: it plugs in through
//! [`intercept::Transport`], and test processes opt in through the
//! `APIMUTANT_INTERCEPT` environment variable.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod catalog;
pub mod intercept;
pub mod invariant;
pub mod mutation;
pub mod operators;
pub mod schema;

pub use catalog::{CatalogOptions, EndpointKey, Mutant, MutantId, enumerate, enumerate_all};
pub use intercept::{InterceptedTransport, InterceptionContext};
pub use schema::{EndpointDescriptor, SchemaParseError};
