//! Network sessions.
//!
//! # Design
//! `Transport` is the only place the crate touches the network. The
//! connection hands it one resolved `HttpRequest` at a time and gets back an
//! `HttpResponse` regardless of status code; interpreting the status is the
//! connection's business. Failures to establish the connection are retried
//! here, a bounded number of times, and never surface to the connection
//! unless the retries are exhausted. Anything that can fail after the
//! request left (read errors, response timeouts) is not retried, so a
//! submission is never sent twice.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::{Headers, HttpMethod, HttpRequest, HttpResponse};

/// Retries applied to transient connection failures by default.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Failures of the underlying network session.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("transport worker stopped: {0}")]
    Worker(String),
}

/// Executes resolved requests over some network session.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Blocking `ureq` agent driven from the async runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct UreqTransport {
    agent: ureq::Agent,
    max_retries: u32,
}

impl UreqTransport {
    pub fn new(verify_tls: bool, max_retries: u32, timeout: Option<Duration>) -> Self {
        let tls = ureq::tls::TlsConfig::builder()
            .disable_verification(!verify_tls)
            .build();
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .tls_config(tls)
            .timeout_global(timeout)
            .build()
            .new_agent();
        Self { agent, max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(false, DEFAULT_MAX_RETRIES, None)
    }
}

#[async_trait]
impl Transport for UreqTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        let request = request.clone();
        let max_retries = self.max_retries;
        tokio::task::spawn_blocking(move || execute_with_retry(&agent, &request, max_retries))
            .await
            .map_err(|e| TransportError::Worker(e.to_string()))?
    }
}

fn execute_with_retry(
    agent: &ureq::Agent,
    request: &HttpRequest,
    max_retries: u32,
) -> Result<HttpResponse, TransportError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match execute_once(agent, request) {
            Ok(response) => return Ok(response),
            Err(err) if is_connect_failure(&err) && attempt <= max_retries => {
                warn!(url = %request.url, attempt, error = %err, "transient transport failure, retrying");
            }
            Err(err) if is_connect_failure(&err) => {
                return Err(TransportError::Connection {
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                return Err(TransportError::Request {
                    url: request.url.clone(),
                    message: err.to_string(),
                });
            }
        }
    }
}

fn execute_once(agent: &ureq::Agent, request: &HttpRequest) -> Result<HttpResponse, ureq::Error> {
    let url = request.url.as_str();
    let body = request.body.as_deref();
    let mut response = match request.method {
        HttpMethod::Get => with_headers(agent.get(url), &request.headers).call(),
        HttpMethod::Head => with_headers(agent.head(url), &request.headers).call(),
        HttpMethod::Delete => with_headers(agent.delete(url), &request.headers).call(),
        HttpMethod::Post => send(with_headers(agent.post(url), &request.headers), body),
        HttpMethod::Put => send(with_headers(agent.put(url), &request.headers), body),
        HttpMethod::Patch => send(with_headers(agent.patch(url), &request.headers), body),
    }?;

    let status = response.status().as_u16();
    let headers: Headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|value| (name.as_str(), value)))
        .collect();
    let body = if request.method == HttpMethod::Head {
        String::new()
    } else {
        response.body_mut().read_to_string()?
    };
    debug!(method = %request.method, url, status, "response received");

    Ok(HttpResponse {
        status,
        url: request.url.clone(),
        headers,
        body,
    })
}

fn with_headers<B>(mut builder: ureq::RequestBuilder<B>, headers: &Headers) -> ureq::RequestBuilder<B> {
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
}

fn send(
    builder: ureq::RequestBuilder<ureq::typestate::WithBody>,
    body: Option<&str>,
) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    match body {
        Some(body) => builder.send(body.as_bytes()),
        None => builder.send_empty(),
    }
}

/// Whether `err` happened before any byte of the request reached the server.
fn is_connect_failure(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::ConnectionFailed | ureq::Error::HostNotFound => true,
        ureq::Error::Timeout(timeout) => matches!(timeout, ureq::Timeout::Resolve | ureq::Timeout::Connect),
        ureq::Error::Io(io) => matches!(io.kind(), ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable),
        _ => false,
    }
}
