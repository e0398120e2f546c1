//! Scripted in-memory transport shared by the integration tests.
//!
//! Routes are keyed by URL path. Each route answers with its queued
//! responses in order and then keeps repeating the last one, which is how a
//! task that has reached its final state behaves. Unknown paths answer 404.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pulp_core::{Connection, HttpRequest, HttpResponse, Transport, TransportError};
use serde_json::{json, Value};

#[derive(Default)]
struct Route {
    responses: VecDeque<HttpResponse>,
    delay: Duration,
}

#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Route>>,
    dispatched: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection(self: &Arc<Self>) -> Connection {
        Connection::builder("http://pulp.test").transport(self.clone()).build()
    }

    pub fn strict_connection(self: &Arc<Self>) -> Connection {
        Connection::builder("http://pulp.test")
            .transport(self.clone())
            .strict(true)
            .build()
    }

    /// Answer `path` with `responses`, repeating the last one.
    pub fn route(&self, path: &str, responses: Vec<(u16, String)>) {
        let mut routes = self.routes.lock();
        let route = routes.entry(path.to_string()).or_default();
        route.responses = responses
            .into_iter()
            .map(|(status, body)| HttpResponse::new(status, body))
            .collect();
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.routes.lock().entry(path.to_string()).or_default().delay = delay;
    }

    /// Script a task that walks through `states`.
    pub fn task(&self, task_id: &str, states: &[&str]) {
        self.task_with(task_id, states, None, &[]);
    }

    /// Script a task with an error payload (shown in the `error` state) and
    /// spawned children.
    pub fn task_with(&self, task_id: &str, states: &[&str], error: Option<Value>, spawned: &[&str]) {
        let responses = states
            .iter()
            .map(|state| {
                let reported_error = if *state == "error" { error.clone() } else { None };
                let mut body = json!({
                    "task_id": task_id,
                    "state": state,
                    "error": reported_error,
                });
                if !spawned.is_empty() {
                    body["spawned_tasks"] = spawned.iter().map(|id| json!({"task_id": id})).collect();
                }
                (200, body.to_string())
            })
            .collect();
        self.route(&task_path(task_id), responses);
    }

    /// Every dispatched URL path, in dispatch order.
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().clone()
    }

    pub fn dispatch_count(&self, path: &str) -> usize {
        self.dispatched.lock().iter().filter(|p| *p == path).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = url::Url::parse(&request.url)
            .map(|url| url.path().to_string())
            .map_err(|e| TransportError::Request {
                url: request.url.clone(),
                message: e.to_string(),
            })?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.dispatched.lock().push(path.clone());

        let (delay, response) = {
            let mut routes = self.routes.lock();
            match routes.get_mut(&path) {
                Some(route) => {
                    let response = if route.responses.len() > 1 {
                        route.responses.pop_front()
                    } else {
                        route.responses.front().cloned()
                    };
                    (route.delay, response.unwrap_or_else(|| HttpResponse::new(200, "")))
                }
                None => (Duration::ZERO, HttpResponse::new(404, "")),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(HttpResponse {
            url: request.url.clone(),
            ..response
        })
    }
}

pub fn task_path(task_id: &str) -> String {
    format!("/pulp/api/v2/tasks/{task_id}/")
}
