//! Gatekeeper - request admission engine.
//!
//! Named rules decide whether a request is allowed, denied or throttled.
//! Allow rules win over everything, then deny rules, then rate limiters and
//! failed-attempt limiters; observers only report. Counts live in fixed time
//! windows in a pluggable counter store, either in-process or gossiped across
//! a peer mesh.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod matchers;
pub mod mesh;
pub mod notify;
pub mod registry;
pub mod request;
pub mod rules;
pub mod store;

pub use dispatcher::{Gatekeeper, Outcome, ResponseStatus, Verdict};
pub use error::{GatekeeperError, Result, StoreError};
pub use registry::{DuplicatePolicy, Registry};
pub use request::Request;
