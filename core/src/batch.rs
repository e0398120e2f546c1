//! Batched, concurrent dispatch.
//!
//! # Design
//! `Connection::open_batch` switches the connection into collecting mode and
//! returns a `BatchScope`. While the scope is open, `Connection::send` queues
//! resolved requests instead of dispatching them. `BatchScope::close` fans
//! the queue out as concurrent futures on the current task; each one takes
//! the connection's dispatch lock for its own round-trip, so the session
//! still sees one request at a time while request preparation and response
//! handling overlap. Responses come back in submission order.
//!
//! The batch stays open until its responses are recorded: while it fans
//! out, sends go straight to the session but a second batch cannot open.
//! Dropping a scope without closing it (panic, cancellation) discards the
//! queue and returns the connection to immediate mode.

use std::future::Future;
use std::mem;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::connection::{Connection, DispatchMode};
use crate::error::ApiError;
use crate::http::HttpResponse;

/// An open batch on a `Connection`.
#[must_use = "a batch dispatches nothing until it is closed"]
pub struct BatchScope<'a> {
    connection: &'a Connection,
    timeout: Option<Duration>,
    closed: bool,
}

impl Connection {
    /// Start collecting requests.
    ///
    /// Fails with `ApiError::Reentrancy` if this connection already has an
    /// open batch; that batch and its queue are left untouched.
    pub async fn open_batch(&self, timeout: Option<Duration>) -> Result<BatchScope<'_>, ApiError> {
        self.ensure_no_batch()?;
        let _permit = self.dispatch_lock.lock().await;
        let mut state = self.state.lock();
        if !matches!(state.mode, DispatchMode::Immediate) {
            return Err(ApiError::Reentrancy {
                url: self.url().to_string(),
            });
        }
        state.mode = DispatchMode::Collecting(Vec::new());
        debug!(url = %self.url(), "batch opened");
        Ok(BatchScope {
            connection: self,
            timeout,
            closed: false,
        })
    }

    /// Open a batch, run `body`, then close the batch.
    ///
    /// The batch is dispatched even when `body` fails; the body's error
    /// then takes precedence over any error from closing.
    pub async fn batch<F, T>(&self, timeout: Option<Duration>, body: F) -> Result<(T, Vec<HttpResponse>), ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        let scope = self.open_batch(timeout).await?;
        let outcome = body.await;
        let closed = scope.close().await;
        match (outcome, closed) {
            (Ok(value), Ok(responses)) => Ok((value, responses)),
            (Err(err), Ok(_)) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(error = %close_err, "closing batch failed after body error");
                Err(err)
            }
            (Ok(_), Err(close_err)) => Err(close_err),
        }
    }

    fn ensure_no_batch(&self) -> Result<(), ApiError> {
        match self.state.lock().mode {
            DispatchMode::Immediate => Ok(()),
            DispatchMode::Collecting(_) | DispatchMode::Dispatching => Err(ApiError::Reentrancy {
                url: self.url().to_string(),
            }),
        }
    }
}

impl BatchScope<'_> {
    /// Number of requests queued so far.
    pub fn pending(&self) -> usize {
        match &self.connection.state.lock().mode {
            DispatchMode::Collecting(queue) => queue.len(),
            DispatchMode::Immediate | DispatchMode::Dispatching => 0,
        }
    }

    /// Dispatch every queued request and collect the responses in
    /// submission order.
    ///
    /// Batch mode ends once the responses are recorded, whatever the
    /// outcome. A timeout aborts the whole batch; requests that already
    /// reached the server are not rolled back, and one still on the wire
    /// keeps the session until it completes.
    pub async fn close(mut self) -> Result<Vec<HttpResponse>, ApiError> {
        self.closed = true;
        let connection = self.connection;
        let queue = {
            let mut state = connection.state.lock();
            match mem::replace(&mut state.mode, DispatchMode::Dispatching) {
                DispatchMode::Collecting(queue) => queue,
                DispatchMode::Immediate | DispatchMode::Dispatching => Vec::new(),
            }
        };
        let pending = queue.len();
        debug!(url = %connection.url(), pending, "closing batch");

        let dispatches = join_all(queue.iter().map(|request| connection.dispatch(request.clone())));
        let results = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, dispatches)
                .await
                .map_err(|_| ApiError::BatchTimeout { timeout, pending })?,
            None => dispatches.await,
        };
        let responses = results.into_iter().collect::<Result<Vec<_>, _>>()?;

        let mut state = connection.state.lock();
        state.last_requests = queue;
        state.last_responses = responses.clone();
        state.mode = DispatchMode::Immediate;
        if let Some(err) = state.validation_error() {
            warn!(url = %connection.url(), pending, "batch rejected by strict validation");
            return Err(err);
        }
        info!(url = %connection.url(), dispatched = pending, "batch closed");
        Ok(responses)
    }
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        let mut state = self.connection.state.lock();
        let previous = mem::replace(&mut state.mode, DispatchMode::Immediate);
        if let (false, DispatchMode::Collecting(queue)) = (self.closed, previous) {
            if !queue.is_empty() {
                warn!(url = %self.connection.url(), discarded = queue.len(), "batch dropped without closing");
            }
        }
    }
}
