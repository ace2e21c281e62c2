// Per-thread stack of executing tasks

use super::result::AsyncResult;
use super::Task;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::sync::{Arc, Mutex, PoisonError};

/// Request context of one task invocation
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub task: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// Results of tasks dispatched from within this invocation
    pub children: Vec<AsyncResult>,
    pub called_directly: bool,
}

impl Request {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            children: Vec::new(),
            called_directly: false,
        }
    }
}

/// Shared handle to a frame's request
pub type RequestHandle = Arc<Mutex<Request>>;

/// One in-flight invocation
#[derive(Clone)]
pub struct ExecutionFrame {
    pub task: Task,
    pub request: RequestHandle,
}

impl ExecutionFrame {
    pub fn new(task: Task, request: Request) -> Self {
        Self {
            task,
            request: Arc::new(Mutex::new(request)),
        }
    }
}

thread_local! {
    static TASK_STACK: RefCell<Vec<ExecutionFrame>> = const { RefCell::new(Vec::new()) };
}

pub fn push_frame(frame: ExecutionFrame) {
    TASK_STACK.with(|stack| stack.borrow_mut().push(frame));
}

pub fn pop_frame() -> Option<ExecutionFrame> {
    TASK_STACK.with(|stack| stack.borrow_mut().pop())
}

/// Task running on this thread, if any
pub fn current_task() -> Option<Task> {
    TASK_STACK.with(|stack| stack.borrow().last().map(|frame| frame.task.clone()))
}

/// Request of the task running on this thread, if any
pub fn current_request() -> Option<RequestHandle> {
    TASK_STACK.with(|stack| stack.borrow().last().map(|frame| Arc::clone(&frame.request)))
}

pub fn stack_depth() -> usize {
    TASK_STACK.with(|stack| stack.borrow().len())
}

/// Append `result` to the children of the running task.
///
/// Returns false (and does nothing) when no task is running.
pub fn attach_to_parent(result: &AsyncResult) -> bool {
    match current_request() {
        Some(request) => {
            request
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .children
                .push(result.clone());
            true
        }
        None => false,
    }
}

/// Pops its frame when dropped, so the stack unwinds on every exit path
pub(crate) struct FrameGuard {
    depth: usize,
}

impl FrameGuard {
    pub(crate) fn enter(frame: ExecutionFrame) -> Self {
        push_frame(frame);
        Self {
            depth: stack_depth(),
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        TASK_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() == self.depth {
                stack.pop();
            }
        });
    }
}
