//! Wire records for asynchronous tasks.
//!
//! # Design
//! Only the minimal envelope needed for polling is typed here: the task
//! representation and the call report returned by asynchronous submissions.
//! Keys this crate does not interpret are preserved in `extra` so nothing the
//! server sent is lost when a record is logged or re-serialized.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::request::api_relative;

/// Server-side representation of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub state: String,
    #[serde(rename = "_href", default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_report: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Present only when the server lists follow-up tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawned_tasks: Option<Vec<SpawnedTask>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to a task spawned by another task or by a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnedTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "_href", alias = "href", default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl SpawnedTask {
    pub fn with_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            href: None,
        }
    }

    /// Path of the task relative to the API root.
    pub fn path(&self) -> Result<String, ApiError> {
        match (&self.href, &self.task_id) {
            (Some(href), _) => Ok(api_relative(href).to_string()),
            (None, Some(task_id)) => Ok(task_path(task_id)),
            (None, None) => Err(ApiError::InvalidTask(
                "spawned task reference has neither task_id nor _href".to_string(),
            )),
        }
    }
}

/// Envelope returned by asynchronous submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    #[serde(default)]
    pub spawned_tasks: Vec<SpawnedTask>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// API-relative path of the task with `task_id`.
pub fn task_path(task_id: &str) -> String {
    format!("tasks/{task_id}/")
}
