//! Client core for the Pulp REST API.
//!
//! # Overview
//! Sends requests to a Pulp server and waits for the asynchronous tasks it
//! spawns. Two pieces carry the coordination:
//!
//! - [`Connection`] dispatches requests one at a time over a single network
//!   session, optionally validating every response, and can collect requests
//!   into a batch that is fanned out concurrently when the batch closes.
//! - [`Task`] polls a server-side job until it settles, and walks the tree
//!   of jobs spawned by a submission until every one of them has settled.
//!
//! # Design
//! - [`Request`] is a pure descriptor; it is resolved into an
//!   [`HttpRequest`] against a connection's address at send time.
//! - [`Transport`] is the only component doing I/O. The default
//!   [`UreqTransport`] retries transient connection failures; tests swap in
//!   scripted transports.
//! - All failures surface as [`ApiError`] variants carrying the requests,
//!   responses or task needed to diagnose them.

pub mod auth;
pub mod batch;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod request;
pub mod task;
pub mod transport;
pub mod types;

pub use auth::{BasicAuth, BearerToken, Credentials};
pub use batch::BatchScope;
pub use config::ConnectionConfig;
pub use connection::{default_acceptance, Acceptance, Connection, ConnectionBuilder, Dispatch, PublicKey};
pub use diagnostics::{format_request, format_response, ExpectedResponse};
pub use error::ApiError;
pub use http::{Headers, HttpMethod, HttpRequest, HttpResponse};
pub use request::{PathRoot, Request, RequestBody};
pub use task::{ReloadOutcome, Task, TaskStatePolicy, TreeWaitOptions, VanishedTaskPolicy, WaitOptions};
pub use transport::{Transport, TransportError, UreqTransport};
pub use types::{CallReport, SpawnedTask, TaskRecord};
