//! Server-side tasks and waiting for them to settle.
//!
//! # Design
//! A `Task` wraps the server's `TaskRecord` together with the state policy
//! that decides when it is finished. Local state only ever changes by
//! re-fetching (`reload`); all transitions happen on the server.
//!
//! `reload` reports a vanished task as `ReloadOutcome::Gone` instead of
//! failing, even on a strict connection, and `wait` maps that outcome
//! through an explicit `VanishedTaskPolicy`. Any other rejected status is
//! still subject to the connection's validation. The default treats a vanished task as settled,
//! which is how the server behaves once finished tasks are purged.
//!
//! Submissions that spawn follow-up tasks return a call report. Waiting on
//! a report walks the spawned-task tree depth-first, in listing order, with
//! an explicit work stack; a task's own completion is not enough, every
//! descendant has to settle too. The first failure anywhere stops the walk.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::ApiError;
use crate::http::HttpResponse;
use crate::request::Request;
use crate::types::{task_path, CallReport, SpawnedTask, TaskRecord};

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Which state tags count as active, ended and failed.
///
/// Termination is decided by the end set alone; the active set is
/// informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatePolicy {
    active: Vec<String>,
    end: Vec<String>,
    error: Vec<String>,
}

impl TaskStatePolicy {
    /// Error states are always treated as end states as well.
    pub fn new(active: &[&str], end: &[&str], error: &[&str]) -> Self {
        let mut end: Vec<String> = end.iter().map(|s| s.to_string()).collect();
        for state in error {
            if !end.iter().any(|e| e == state) {
                end.push(state.to_string());
            }
        }
        Self {
            active: active.iter().map(|s| s.to_string()).collect(),
            end,
            error: error.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_active(&self, state: &str) -> bool {
        self.active.iter().any(|s| s == state)
    }

    pub fn is_end(&self, state: &str) -> bool {
        self.end.iter().any(|s| s == state)
    }

    pub fn is_error(&self, state: &str) -> bool {
        self.error.iter().any(|s| s == state)
    }
}

impl Default for TaskStatePolicy {
    fn default() -> Self {
        Self::new(
            &["running", "waiting"],
            &["finished", "error", "canceled", "cancelled"],
            &["error"],
        )
    }
}

/// What `wait` does when the task disappears from the server mid-wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VanishedTaskPolicy {
    /// Stop waiting and judge the task by its last observed state.
    #[default]
    Settled,
    /// Fail with `ApiError::NotFound`.
    Fail,
}

/// Polling parameters for `Task::wait`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub vanished: VanishedTaskPolicy,
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn vanished(mut self, policy: VanishedTaskPolicy) -> Self {
        self.vanished = policy;
        self
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            vanished: VanishedTaskPolicy::default(),
        }
    }
}

/// Parameters for waiting on a tree of spawned tasks.
///
/// Every task in the tree gets the full `wait.timeout`; there is no
/// aggregate deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeWaitOptions {
    pub wait: WaitOptions,
    /// Deepest level of spawned tasks to follow; `None` follows any depth.
    pub max_depth: Option<usize>,
}

impl TreeWaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            wait: WaitOptions::with_timeout(timeout),
            max_depth: None,
        }
    }
}

impl Default for TreeWaitOptions {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_REPORT_TIMEOUT)
    }
}

/// Result of re-fetching a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The task still exists; carries its current state.
    Found(String),
    /// The server no longer knows the task.
    Gone,
}

/// A server-side job as last observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    record: TaskRecord,
    policy: TaskStatePolicy,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({}, state={})", self.record.task_id, self.record.state)
    }
}

impl Task {
    pub fn from_record(record: TaskRecord) -> Self {
        Self {
            record,
            policy: TaskStatePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TaskStatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Parse one task, or a list of tasks, from a response body.
    pub fn from_response(response: &HttpResponse) -> Result<Vec<Task>, ApiError> {
        let items = match response.json::<Value>()? {
            Value::Array(items) => items,
            other => vec![other],
        };
        items.into_iter().map(Self::from_value).collect()
    }

    fn from_value(value: Value) -> Result<Task, ApiError> {
        serde_json::from_value::<TaskRecord>(value)
            .map(Task::from_record)
            .map_err(|e| ApiError::InvalidTask(e.to_string()))
    }

    /// Look a task up by id.
    pub async fn get(conn: &Connection, task_id: &str) -> Result<Task, ApiError> {
        let response = conn.fetch_tolerating(&Request::get(task_path(task_id)), 404).await?;
        if response.status == 404 {
            return Err(ApiError::NotFound {
                id: task_id.to_string(),
            });
        }
        Self::from_value(expect_success(response)?.json()?)
    }

    /// All tasks the server currently tracks.
    pub async fn list(conn: &Connection) -> Result<Vec<Task>, ApiError> {
        let response = expect_success(conn.fetch(&Request::get("tasks/")).await?)?;
        Self::from_response(&response)
    }

    pub fn id(&self) -> &str {
        &self.record.task_id
    }

    pub fn state(&self) -> &str {
        &self.record.state
    }

    pub fn error(&self) -> Option<&Value> {
        self.record.error.as_ref()
    }

    pub fn result(&self) -> Option<&Value> {
        self.record.result.as_ref()
    }

    pub fn spawned_tasks(&self) -> &[SpawnedTask] {
        self.record.spawned_tasks.as_deref().unwrap_or_default()
    }

    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn is_active(&self) -> bool {
        self.policy.is_active(&self.record.state)
    }

    pub fn is_end(&self) -> bool {
        self.policy.is_end(&self.record.state)
    }

    pub fn is_error(&self) -> bool {
        self.policy.is_error(&self.record.state)
    }

    /// Re-fetch from the server and overwrite the local record.
    pub async fn reload(&mut self, conn: &Connection) -> Result<ReloadOutcome, ApiError> {
        let response = conn
            .fetch_tolerating(&Request::get(task_path(&self.record.task_id)), 404)
            .await?;
        if response.status == 404 {
            return Ok(ReloadOutcome::Gone);
        }
        let fresh = Self::from_value(expect_success(response)?.json()?)?;
        self.record = fresh.record;
        Ok(ReloadOutcome::Found(self.record.state.clone()))
    }

    /// Poll until the task reaches an end state.
    ///
    /// The deadline is fixed on entry and checked once per poll cycle, so
    /// an in-flight reload is never cut short. Returns `TaskTimeout` when
    /// the deadline passes first, `TaskFailure` when the task ends in an
    /// error state.
    pub async fn wait(&mut self, conn: &Connection, options: &WaitOptions) -> Result<(), ApiError> {
        let deadline = Instant::now() + options.timeout;
        loop {
            if Instant::now() > deadline {
                return Err(ApiError::TaskTimeout {
                    task: Box::new(self.clone()),
                    timeout: options.timeout,
                });
            }
            sleep(options.poll_interval).await;
            match self.reload(conn).await? {
                ReloadOutcome::Gone => match options.vanished {
                    VanishedTaskPolicy::Settled => {
                        warn!(task_id = %self.id(), last_state = %self.state(), "task vanished while waiting");
                        break;
                    }
                    VanishedTaskPolicy::Fail => {
                        return Err(ApiError::NotFound {
                            id: self.record.task_id.clone(),
                        });
                    }
                },
                ReloadOutcome::Found(state) => {
                    debug!(task_id = %self.id(), %state, "polled task");
                    if self.policy.is_end(&state) {
                        break;
                    }
                }
            }
        }

        if self.is_error() {
            return Err(ApiError::TaskFailure {
                error: self.record.error.clone().unwrap_or(Value::Null),
                task: Box::new(self.clone()),
            });
        }
        info!(task_id = %self.id(), state = %self.state(), "task settled");
        Ok(())
    }

    /// Wait on every task carried by `response`, one after the other.
    pub async fn wait_for_response(conn: &Connection, response: &HttpResponse, timeout: Duration) -> Result<(), ApiError> {
        Self::wait_for_response_with(conn, response, &WaitOptions::with_timeout(timeout)).await
    }

    pub async fn wait_for_response_with(
        conn: &Connection,
        response: &HttpResponse,
        options: &WaitOptions,
    ) -> Result<(), ApiError> {
        for mut task in Self::from_response(response)? {
            task.wait(conn, options).await?;
        }
        Ok(())
    }

    /// Wait on every task spawned by the call report in `response`,
    /// including tasks spawned by those tasks.
    pub async fn wait_for_report(conn: &Connection, response: &HttpResponse, timeout: Duration) -> Result<(), ApiError> {
        Self::wait_for_report_with(conn, response, &TreeWaitOptions::with_timeout(timeout)).await
    }

    pub async fn wait_for_report_with(
        conn: &Connection,
        response: &HttpResponse,
        options: &TreeWaitOptions,
    ) -> Result<(), ApiError> {
        let report: CallReport = response.json()?;
        let mut pending: Vec<(SpawnedTask, usize)> =
            report.spawned_tasks.into_iter().rev().map(|spawned| (spawned, 1)).collect();

        while let Some((spawned, depth)) = pending.pop() {
            if let Some(max_depth) = options.max_depth {
                if depth > max_depth {
                    return Err(ApiError::SpawnDepthExceeded { max_depth });
                }
            }
            let request = Request::get(spawned.path()?);

            let Some(response) = fetch_spawned(conn, &request, &spawned, options.wait.vanished).await? else {
                continue;
            };
            Self::wait_for_response_with(conn, &response, &options.wait).await?;

            let Some(response) = fetch_spawned(conn, &request, &spawned, options.wait.vanished).await? else {
                continue;
            };
            let children: Vec<SpawnedTask> = Self::from_response(&response)?
                .into_iter()
                .flat_map(|task| task.record.spawned_tasks.unwrap_or_default())
                .collect();
            if !children.is_empty() {
                debug!(path = %request.path(), depth, spawned = children.len(), "following spawned tasks");
            }
            pending.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        Ok(())
    }

    /// Wait on each report in order; each gets the full `timeout`.
    pub async fn wait_for_reports(conn: &Connection, responses: &[HttpResponse], timeout: Duration) -> Result<(), ApiError> {
        let options = TreeWaitOptions::with_timeout(timeout);
        for response in responses {
            Self::wait_for_report_with(conn, response, &options).await?;
        }
        Ok(())
    }
}

fn expect_success(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ApiError::HttpError {
            status: response.status,
            body: response.body,
        })
    }
}

/// Fetch a spawned task; `None` when it is gone and gone counts as settled.
async fn fetch_spawned(
    conn: &Connection,
    request: &Request,
    spawned: &SpawnedTask,
    vanished: VanishedTaskPolicy,
) -> Result<Option<HttpResponse>, ApiError> {
    let response = conn.fetch_tolerating(request, 404).await?;
    if response.status != 404 {
        return expect_success(response).map(Some);
    }
    match vanished {
        VanishedTaskPolicy::Settled => {
            warn!(path = %request.path(), "spawned task vanished");
            Ok(None)
        }
        VanishedTaskPolicy::Fail => Err(ApiError::NotFound {
            id: spawned.task_id.clone().unwrap_or_else(|| request.path().to_string()),
        }),
    }
}
