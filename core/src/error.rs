//! Error types for the Pulp client core.
//!
//! # Design
//! One enum covers every failure a caller can observe. Variants that stem
//! from a protocol or polling failure carry the evidence needed to diagnose
//! it without re-querying the server: the offending requests and responses,
//! or the task as last observed. Network-session failures are wrapped as
//! `Transport` after the transport's own retry policy has given up.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::diagnostics::{format_request, format_response};
use crate::http::{HttpRequest, HttpResponse};
use crate::task::Task;
use crate::transport::TransportError;

/// Errors returned by connections and task waiters.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Strict validation is on and a response failed the acceptance predicate.
    #[error("pulp was not OK:\n{}", render_exchange(.requests, .responses))]
    Validation {
        requests: Vec<HttpRequest>,
        responses: Vec<HttpResponse>,
    },

    /// A batch was opened while another one is still collecting.
    #[error("already collecting a batch on connection to {url}")]
    Reentrancy { url: String },

    /// A batch did not finish dispatching within its overall timeout.
    #[error("batch of {pending} request(s) exceeded {timeout:?}")]
    BatchTimeout { timeout: Duration, pending: usize },

    /// A task did not reach an end state before its deadline.
    #[error("waiting exceeded {timeout:?}: {task}")]
    TaskTimeout { task: Box<Task>, timeout: Duration },

    /// A task settled in an error state.
    #[error("task failed: {error}: {task}")]
    TaskFailure { task: Box<Task>, error: Value },

    /// The requested task does not exist (any more).
    #[error("task not found: {id}")]
    NotFound { id: String },

    /// A typed result was requested but the server answered with an
    /// unexpected status.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// A spawned-task tree went deeper than the configured cap.
    #[error("spawned task tree exceeded depth {max_depth}")]
    SpawnDepthExceeded { max_depth: usize },

    /// A response was required while the connection is collecting a batch.
    #[error("request was queued into an open batch; no response is available yet")]
    Deferred,

    /// The public key resource was served with an empty body.
    #[error("got empty public key content:\n{}", format_response(.response))]
    EmptyPublicKey { response: HttpResponse },

    /// A task payload lacked a required field or had the wrong shape.
    #[error("invalid task payload: {0}")]
    InvalidTask(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

fn render_exchange(requests: &[HttpRequest], responses: &[HttpResponse]) -> String {
    let mut rendered = String::new();
    for request in requests {
        rendered.push_str(&format_request(request));
    }
    for response in responses {
        rendered.push_str(&format_response(response));
    }
    rendered
}
