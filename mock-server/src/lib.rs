//! In-memory stand-in for the parts of the Pulp REST API the client core
//! talks to: scripted tasks, repository sync submissions that answer with a
//! call report, the static public key, and an echo endpoint that reflects
//! what the client sent.
//!
//! Each scripted task walks through its list of states, one state per GET,
//! and then stays in the last one. A task can be told to vanish (answer
//! 404) after a number of polls.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    routing::{any, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;

pub const API_ROOT: &str = "/pulp/api/v2";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptedTask {
    pub task_id: String,
    pub states: Vec<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub spawned: Vec<String>,
    /// Answer 404 once this many GETs have been served.
    #[serde(default)]
    pub vanish_after: Option<usize>,
    #[serde(skip)]
    polls: usize,
}

impl ScriptedTask {
    pub fn new(task_id: &str, states: &[&str]) -> Self {
        Self {
            task_id: task_id.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
            error: None,
            spawned: Vec::new(),
            vanish_after: None,
            polls: 0,
        }
    }

    pub fn spawns(mut self, task_ids: &[&str]) -> Self {
        self.spawned = task_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn failing_with(mut self, error: Value) -> Self {
        self.error = Some(error);
        self
    }

    pub fn vanishing_after(mut self, polls: usize) -> Self {
        self.vanish_after = Some(polls);
        self
    }

    fn current_state(&self) -> &str {
        let index = self.polls.min(self.states.len().saturating_sub(1));
        self.states.get(index).map(String::as_str).unwrap_or("waiting")
    }

    fn to_json(&self) -> Value {
        let state = self.current_state();
        let error = match &self.error {
            Some(error) if state == "error" => error.clone(),
            _ => Value::Null,
        };
        let mut body = json!({
            "_href": task_href(&self.task_id),
            "task_id": self.task_id,
            "state": state,
            "result": null,
            "error": error,
            "tags": [],
        });
        if !self.spawned.is_empty() {
            body["spawned_tasks"] = Value::Array(self.spawned.iter().map(|id| spawned_ref(id)).collect());
        }
        body
    }
}

#[derive(Debug, Default)]
pub struct PulpState {
    tasks: HashMap<String, ScriptedTask>,
    syncs: HashMap<String, Vec<String>>,
    public_key: String,
}

impl PulpState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: ScriptedTask) -> Self {
        self.tasks.insert(task.task_id.clone(), task);
        self
    }

    /// Syncing `repo_id` answers with a call report spawning `task_ids`.
    pub fn with_sync(mut self, repo_id: &str, task_ids: &[&str]) -> Self {
        self.syncs
            .insert(repo_id.to_string(), task_ids.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_public_key(mut self, pem: &str) -> Self {
        self.public_key = pem.to_string();
        self
    }

    /// A repository `zoo` whose sync task spawns a publish task when done.
    pub fn demo() -> Self {
        Self::new()
            .with_sync("zoo", &["sync-zoo"])
            .with_task(ScriptedTask::new("sync-zoo", &["waiting", "running", "finished"]).spawns(&["publish-zoo"]))
            .with_task(ScriptedTask::new("publish-zoo", &["running", "finished"]))
            .with_public_key("-----BEGIN PUBLIC KEY-----\nMOCK\n-----END PUBLIC KEY-----\n")
    }
}

pub type Db = Arc<RwLock<PulpState>>;

pub fn app() -> Router {
    app_with(PulpState::new())
}

pub fn app_with(state: PulpState) -> Router {
    let db: Db = Arc::new(RwLock::new(state));
    Router::new()
        .route("/pulp/api/v2/status/", get(status))
        .route("/pulp/api/v2/tasks/", get(list_tasks))
        .route("/pulp/api/v2/tasks/{id}/", get(get_task))
        .route("/pulp/api/v2/repositories/{repo_id}/actions/sync/", post(sync_repository))
        .route("/pulp/api/v2/echo/", any(echo))
        .route("/pulp/static/rsa_pub.key", get(public_key))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with(listener, PulpState::new()).await
}

pub async fn run_with(listener: TcpListener, state: PulpState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with(state)).await
}

fn task_href(task_id: &str) -> String {
    format!("{API_ROOT}/tasks/{task_id}/")
}

fn spawned_ref(task_id: &str) -> Value {
    json!({"_href": task_href(task_id), "task_id": task_id})
}

async fn status() -> Json<Value> {
    Json(json!({"api_version": "2", "database_connection": {"connected": true}}))
}

async fn list_tasks(State(db): State<Db>) -> Json<Vec<Value>> {
    let state = db.read().await;
    Json(state.tasks.values().map(ScriptedTask::to_json).collect())
}

async fn get_task(State(db): State<Db>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    let mut state = db.write().await;
    let task = state.tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    if task.vanish_after.is_some_and(|limit| task.polls >= limit) {
        return Err(StatusCode::NOT_FOUND);
    }
    let body = task.to_json();
    task.polls += 1;
    debug!(task_id = %id, state = %body["state"], "served task");
    Ok(Json(body))
}

async fn sync_repository(
    State(db): State<Db>,
    Path(repo_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let state = db.read().await;
    let spawned = state.syncs.get(&repo_id).ok_or(StatusCode::NOT_FOUND)?;
    let report = json!({
        "result": null,
        "error": null,
        "spawned_tasks": spawned.iter().map(|id| spawned_ref(id)).collect::<Vec<_>>(),
    });
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> Json<Value> {
    let header_value = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "content_type": header_value(header::CONTENT_TYPE),
        "authorization": header_value(header::AUTHORIZATION),
        "body": body,
    }))
}

async fn public_key(State(db): State<Db>) -> String {
    db.read().await.public_key.clone()
}
