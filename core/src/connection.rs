//! The client handle: one network session, one dispatch lock, one mode.
//!
//! # Design
//! A `Connection` owns the transport, the credentials and the base address.
//! Every physical dispatch holds `dispatch_lock` for its whole duration, so
//! at most one request is in flight on the session at any instant, whether
//! the caller is sending one request or fanning out a batch. The round-trip
//! runs on its own tokio task that owns the lock guard: a caller that stops
//! waiting (timeout, dropped future) does not release the session while the
//! request is still on the wire. Copies of a connection share the session
//! and therefore the lock.
//!
//! The dispatch mode is an explicit enum: either requests go out
//! immediately, or they are collected into the queue of the open batch
//! (see `batch`). A collecting connection without a queue cannot be
//! expressed.
//!
//! Strict validation checks every recorded response against an acceptance
//! predicate and turns mismatches into `ApiError::Validation`. With strict
//! validation off, callers inspect the returned `HttpResponse` themselves.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, warn};

use crate::auth::{BasicAuth, Credentials};
use crate::config::ConnectionConfig;
use crate::error::ApiError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::request::Request;
use crate::transport::{Transport, TransportError, UreqTransport, DEFAULT_MAX_RETRIES};

/// Static resource holding the server's public signing key.
pub const PUBLIC_KEY_PATH: &str = "rsa_pub.key";

/// Predicate deciding whether a response counts as OK under strict validation.
pub type Acceptance = Arc<dyn Fn(&HttpResponse) -> bool + Send + Sync>;

/// Accepts any status in the success or redirect range (200-399).
pub fn default_acceptance() -> Acceptance {
    Arc::new(|response: &HttpResponse| response.is_success())
}

pub(crate) enum DispatchMode {
    Immediate,
    Collecting(Vec<HttpRequest>),
    /// A closed batch is fanning out; new sends go out immediately but no
    /// other batch may open until it has recorded its responses.
    Dispatching,
}

/// How a single dispatch is judged against the acceptance predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Check {
    /// Only when the connection is strict.
    Configured,
    /// As `Configured`, but a response with this status is left to the caller.
    Tolerating(u16),
    /// Always, whatever the connection's setting.
    Always,
}

pub(crate) struct ConnectionState {
    pub(crate) mode: DispatchMode,
    pub(crate) strict: bool,
    pub(crate) acceptance: Acceptance,
    pub(crate) last_requests: Vec<HttpRequest>,
    pub(crate) last_responses: Vec<HttpResponse>,
}

impl ConnectionState {
    /// The recorded exchange as an error if any response is not accepted.
    pub(crate) fn rejection(&self) -> Option<ApiError> {
        let rejected = !self.last_responses.iter().all(|r| (self.acceptance)(r));
        rejected.then(|| ApiError::Validation {
            requests: self.last_requests.clone(),
            responses: self.last_responses.clone(),
        })
    }

    pub(crate) fn validation_error(&self) -> Option<ApiError> {
        if self.strict {
            self.rejection()
        } else {
            None
        }
    }
}

/// Outcome of `Connection::send`.
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// The request went out and this is its response.
    Completed(HttpResponse),
    /// The request was queued into the open batch at this position; its
    /// response materializes when the batch closes.
    Queued { position: usize },
}

impl Dispatch {
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            Dispatch::Completed(response) => Some(response),
            Dispatch::Queued { .. } => None,
        }
    }

    pub fn into_response(self) -> Result<HttpResponse, ApiError> {
        match self {
            Dispatch::Completed(response) => Ok(response),
            Dispatch::Queued { .. } => Err(ApiError::Deferred),
        }
    }
}

/// The server's public signing key, as served (PEM text).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pem: String,
}

impl PublicKey {
    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// Handle to one Pulp server.
pub struct Connection {
    url: String,
    credentials: Option<Arc<dyn Credentials>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) dispatch_lock: Arc<AsyncMutex<()>>,
    pub(crate) state: Mutex<ConnectionState>,
    public_key: OnceCell<PublicKey>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .field("strict", &state.strict)
            .field("collecting", &matches!(state.mode, DispatchMode::Collecting(_)))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connection with the default `ureq` transport and no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self::builder(url).build()
    }

    pub fn builder(url: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(url)
    }

    pub fn from_config(config: &ConnectionConfig) -> Self {
        let mut builder = Self::builder(config.url.clone())
            .verify_tls(config.verify_tls)
            .max_retries(config.max_retries)
            .strict(config.strict);
        if let Some(timeout) = config.request_timeout() {
            builder = builder.request_timeout(timeout);
        }
        if let Some(username) = &config.username {
            let password = config.password.clone().unwrap_or_default();
            builder = builder.credentials(BasicAuth::new(username.clone(), password));
        }
        builder.build()
    }

    /// A fresh connection to the same server with the same credentials and
    /// session, but none of this connection's mode, history or cached key.
    ///
    /// The session is shared, so dispatches through the copy and through
    /// `self` still go out one at a time.
    pub fn copy(&self) -> Self {
        Self::with_parts(
            self.url.clone(),
            self.credentials.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.dispatch_lock),
            false,
            default_acceptance(),
        )
    }

    fn with_parts(
        url: String,
        credentials: Option<Arc<dyn Credentials>>,
        transport: Arc<dyn Transport>,
        dispatch_lock: Arc<AsyncMutex<()>>,
        strict: bool,
        acceptance: Acceptance,
    ) -> Self {
        Self {
            url,
            credentials,
            transport,
            dispatch_lock,
            state: Mutex::new(ConnectionState {
                mode: DispatchMode::Immediate,
                strict,
                acceptance,
                last_requests: Vec::new(),
                last_responses: Vec::new(),
            }),
            public_key: OnceCell::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolve `request` and either dispatch it or queue it into the open batch.
    ///
    /// Queued requests are resolved now, so later changes to the connection
    /// cannot alter what goes out when the batch closes.
    pub async fn send(&self, request: &Request) -> Result<Dispatch, ApiError> {
        self.send_checked(request, Check::Configured).await
    }

    pub(crate) async fn send_checked(&self, request: &Request, check: Check) -> Result<Dispatch, ApiError> {
        let prepared = request.build(&self.url, self.credentials.as_deref())?;
        let prepared = match self.enqueue(prepared) {
            Ok(position) => {
                debug!(%request, position, "queued into batch");
                return Ok(Dispatch::Queued { position });
            }
            Err(prepared) => prepared,
        };

        debug!(method = %prepared.method, url = %prepared.url, "dispatching request");
        let response = self.dispatch(prepared.clone()).await?;

        let mut state = self.state.lock();
        state.last_requests = vec![prepared];
        state.last_responses = vec![response.clone()];
        let enforced = match check {
            Check::Configured => state.strict,
            Check::Tolerating(status) => state.strict && response.status != status,
            Check::Always => true,
        };
        if enforced {
            if let Some(err) = state.rejection() {
                warn!(%request, status = response.status, "response rejected by validation");
                return Err(err);
            }
        }
        Ok(Dispatch::Completed(response))
    }

    /// `send` for callers that need the response right away.
    pub async fn fetch(&self, request: &Request) -> Result<HttpResponse, ApiError> {
        self.send(request).await?.into_response()
    }

    /// `fetch` where a response with `status` is returned unvalidated even
    /// on a strict connection.
    pub(crate) async fn fetch_tolerating(&self, request: &Request, status: u16) -> Result<HttpResponse, ApiError> {
        self.send_checked(request, Check::Tolerating(status)).await?.into_response()
    }

    /// Queue `prepared` if a batch is open, or hand it back.
    fn enqueue(&self, prepared: HttpRequest) -> Result<usize, HttpRequest> {
        let mut state = self.state.lock();
        match &mut state.mode {
            DispatchMode::Collecting(queue) => {
                queue.push(prepared);
                Ok(queue.len() - 1)
            }
            DispatchMode::Immediate | DispatchMode::Dispatching => Err(prepared),
        }
    }

    /// Execute one resolved request under the dispatch lock.
    ///
    /// The guard travels with the round-trip into a worker task and is
    /// released only when the transport returns.
    pub(crate) async fn dispatch(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let permit = Arc::clone(&self.dispatch_lock).lock_owned().await;
        let transport = Arc::clone(&self.transport);
        let worker = tokio::spawn(async move {
            let _permit = permit;
            transport.execute(&request).await
        });
        let response = worker
            .await
            .map_err(|e| TransportError::Worker(e.to_string()))??;
        Ok(response)
    }

    /// Override strict validation until the returned guard is dropped.
    ///
    /// `acceptance` replaces the predicate when given; otherwise the current
    /// one stays in effect. Prior values come back on every exit path.
    pub fn strict_validation(&self, enabled: bool, acceptance: Option<Acceptance>) -> StrictValidationGuard<'_> {
        let mut state = self.state.lock();
        let previous_strict = std::mem::replace(&mut state.strict, enabled);
        let previous_acceptance = match acceptance {
            Some(acceptance) => std::mem::replace(&mut state.acceptance, acceptance),
            None => Arc::clone(&state.acceptance),
        };
        StrictValidationGuard {
            connection: self,
            previous_strict,
            previous_acceptance,
        }
    }

    /// Run `body` with strict validation overridden.
    pub async fn with_strict_validation<F: Future>(
        &self,
        enabled: bool,
        acceptance: Option<Acceptance>,
        body: F,
    ) -> F::Output {
        let _guard = self.strict_validation(enabled, acceptance);
        body.await
    }

    pub fn is_strict(&self) -> bool {
        self.state.lock().strict
    }

    /// Whether every last recorded response passes the acceptance predicate.
    /// True before anything was recorded.
    pub fn is_ok(&self) -> bool {
        let state = self.state.lock();
        state.last_responses.iter().all(|r| (state.acceptance)(r))
    }

    pub fn last_requests(&self) -> Vec<HttpRequest> {
        self.state.lock().last_requests.clone()
    }

    pub fn last_responses(&self) -> Vec<HttpResponse> {
        self.state.lock().last_responses.clone()
    }

    pub fn is_collecting(&self) -> bool {
        matches!(self.state.lock().mode, DispatchMode::Collecting(_))
    }

    /// The server's public key, fetched on first use and cached afterwards.
    pub async fn public_key(&self) -> Result<&PublicKey, ApiError> {
        self.public_key.get_or_try_init(|| self.fetch_public_key()).await
    }

    async fn fetch_public_key(&self) -> Result<PublicKey, ApiError> {
        let request = Request::static_resource(HttpMethod::Get, PUBLIC_KEY_PATH);
        let response = self.send_checked(&request, Check::Always).await?.into_response()?;
        if response.body.is_empty() {
            return Err(ApiError::EmptyPublicKey { response });
        }
        debug!(url = %self.url, "cached server public key");
        Ok(PublicKey { pem: response.body })
    }
}

/// Restores the previous strict-validation settings when dropped.
pub struct StrictValidationGuard<'a> {
    connection: &'a Connection,
    previous_strict: bool,
    previous_acceptance: Acceptance,
}

impl Drop for StrictValidationGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.connection.state.lock();
        state.strict = self.previous_strict;
        state.acceptance = Arc::clone(&self.previous_acceptance);
    }
}

/// Builder for `Connection`.
pub struct ConnectionBuilder {
    url: String,
    credentials: Option<Arc<dyn Credentials>>,
    transport: Option<Arc<dyn Transport>>,
    verify_tls: bool,
    max_retries: u32,
    request_timeout: Option<Duration>,
    strict: bool,
    acceptance: Acceptance,
}

impl ConnectionBuilder {
    fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            transport: None,
            verify_tls: false,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: None,
            strict: false,
            acceptance: default_acceptance(),
        }
    }

    pub fn credentials(mut self, credentials: impl Credentials + 'static) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    /// Use a custom transport; TLS, retry and timeout settings are then
    /// the transport's concern.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn acceptance(mut self, acceptance: impl Fn(&HttpResponse) -> bool + Send + Sync + 'static) -> Self {
        self.acceptance = Arc::new(acceptance);
        self
    }

    pub fn build(self) -> Connection {
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(UreqTransport::new(self.verify_tls, self.max_retries, self.request_timeout))
        });
        Connection::with_parts(
            self.url,
            self.credentials,
            transport,
            Arc::new(AsyncMutex::new(())),
            self.strict,
            self.acceptance,
        )
    }
}
