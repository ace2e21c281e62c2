// Task message wire format

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of a task message as published to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique task id
    pub id: String,
    /// Registered task name
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Number of times this task has been retried
    #[serde(default)]
    pub retries: u32,
    /// Earliest time the task may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    /// Time after which the task should be discarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default = "default_utc")]
    pub utc: bool,
    /// Serialized signatures to apply on success
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub callbacks: Vec<Value>,
    /// Serialized signatures to apply on failure
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errbacks: Vec<Value>,
    /// (soft, hard) time limits in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timelimit: Option<(Option<f64>, Option<f64>)>,
    /// Id of the task that sent this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Timestamp when message was published
    pub published_at: DateTime<Utc>,
}

fn default_utc() -> bool {
    true
}

impl TaskMessage {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            retries: 0,
            eta: None,
            expires: None,
            utc: true,
            callbacks: Vec::new(),
            errbacks: Vec::new(),
            timelimit: None,
            parent_id: None,
            published_at: Utc::now(),
        }
    }
}
