// Handles to dispatched or eagerly executed tasks

use crate::app::App;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Observable state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Sent to the broker; no outcome known locally
    Pending,
    Success,
    Failure,
}

#[derive(Debug)]
struct EagerOutcome {
    result: Result<Value, String>,
    children: Vec<AsyncResult>,
}

/// Handle to a task by id, bound to the app that dispatched it
#[derive(Clone)]
pub struct AsyncResult {
    id: String,
    task_name: Option<String>,
    app: App,
    outcome: Option<Arc<EagerOutcome>>,
}

impl AsyncResult {
    pub fn new(id: impl Into<String>, task_name: Option<String>, app: App) -> Self {
        Self {
            id: id.into(),
            task_name,
            app,
            outcome: None,
        }
    }

    pub(crate) fn eager(
        id: impl Into<String>,
        task_name: &str,
        app: App,
        result: Result<Value, String>,
        children: Vec<AsyncResult>,
    ) -> Self {
        Self {
            id: id.into(),
            task_name: Some(task_name.to_string()),
            app,
            outcome: Some(Arc::new(EagerOutcome { result, children })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_name(&self) -> Option<&str> {
        self.task_name.as_deref()
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn is_eager(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn state(&self) -> TaskState {
        match self.outcome.as_deref() {
            None => TaskState::Pending,
            Some(EagerOutcome { result: Ok(_), .. }) => TaskState::Success,
            Some(EagerOutcome { result: Err(_), .. }) => TaskState::Failure,
        }
    }

    /// Return value of an eagerly executed task
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_deref().and_then(|o| o.result.as_ref().ok())
    }

    /// Error message of an eagerly executed task that failed
    pub fn error(&self) -> Option<&str> {
        self.outcome
            .as_deref()
            .and_then(|o| o.result.as_ref().err())
            .map(String::as_str)
    }

    /// Results dispatched from within an eagerly executed task
    pub fn children(&self) -> &[AsyncResult] {
        self.outcome
            .as_deref()
            .map(|o| o.children.as_slice())
            .unwrap_or_default()
    }
}

impl PartialEq for AsyncResult {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AsyncResult {}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<AsyncResult: {}>", self.id)
    }
}
