// Task descriptors, the per-app task registry and in-process execution

pub mod annotations;
pub mod result;
pub mod shared;
pub mod stack;

pub use annotations::Annotation;
pub use result::{AsyncResult, TaskState};
pub use shared::{shared_task, SharedTask};
pub use stack::{
    attach_to_parent, current_request, current_task, pop_frame, push_frame, ExecutionFrame,
    Request, RequestHandle,
};

use crate::app::{registry, App, AppInner, SendOptions};
use crate::errors::{AppError, ConfigError, TaskError};
use serde_json::{Map, Value};
use stack::FrameGuard;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Task body
pub type TaskFn = Arc<dyn Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync>;

/// Hook run on a newly defined task; the task it returns is the one registered
pub type TaskFilter = Arc<dyn Fn(Task) -> Task + Send + Sync>;

/// Arguments and identity handed to a task body
pub struct Invocation {
    pub task: Task,
    pub id: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Invocation {
    /// App the running task is bound to
    pub fn app(&self) -> App {
        self.task.app()
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }
}

/// Options for defining a task on an app
#[derive(Clone)]
pub struct TaskOptions {
    /// Explicit task name; otherwise derived from module and function name
    pub name: Option<String>,
    /// Declaring module; `None` means the entry module `__main__`
    pub module: Option<String>,
    /// Also register the task for every other app
    pub shared: bool,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub filter: Option<TaskFilter>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            name: None,
            module: None,
            shared: true,
            queue: None,
            exchange: None,
            routing_key: None,
            filter: None,
        }
    }
}

impl fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOptions")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("shared", &self.shared)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl TaskOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Pass every new instance of the task through `filter` before it is registered
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Task) -> Task + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub(crate) fn apply_filter(&self, task: Task) -> Task {
        match &self.filter {
            Some(filter) => filter(task),
            None => task,
        }
    }
}

/// Qualified task name for function `function` declared in `module`.
///
/// Tasks declared in the entry module are qualified with the app's main name.
pub fn task_name(main: Option<&str>, module: Option<&str>, function: &str) -> String {
    let module = module.unwrap_or("__main__");
    match (module, main) {
        ("__main__", Some(main)) => format!("{}.{}", main, function),
        (module, _) => format!("{}.{}", module, function),
    }
}

struct TaskInner {
    name: String,
    shared: bool,
    run: TaskFn,
    queue: Option<String>,
    exchange: Option<String>,
    routing_key: Option<String>,
    app: RwLock<Weak<AppInner>>,
    annotated: RwLock<Option<Annotated>>,
}

/// Definition with the bound app's annotations applied
#[derive(Clone)]
struct Annotated {
    app_id: u64,
    run: TaskFn,
    queue: Option<String>,
    exchange: Option<String>,
    routing_key: Option<String>,
}

/// A task descriptor.
///
/// Clones share the binding: rebinding one clone to another app is seen by all.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(name: String, run: TaskFn, options: &TaskOptions) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name,
                shared: options.shared,
                run,
                queue: options.queue.clone(),
                exchange: options.exchange.clone(),
                routing_key: options.routing_key.clone(),
                app: RwLock::new(Weak::new()),
                annotated: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_shared(&self) -> bool {
        self.inner.shared
    }

    /// The bound app, or the current app when the binding is gone
    pub fn app(&self) -> App {
        self.bound_app().unwrap_or_else(registry::current_app)
    }

    fn bound_app(&self) -> Option<App> {
        self.inner
            .app
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .map(App::from_inner)
    }

    /// Bind this descriptor (and every clone of it) to `app`.
    ///
    /// The app's annotations are applied on the next use of the task.
    pub fn bind(&self, app: &App) {
        *self.inner.app.write().unwrap_or_else(PoisonError::into_inner) = app.downgrade();
        self.clear_annotations();
    }

    pub(crate) fn has_body(&self, run: &TaskFn) -> bool {
        Arc::ptr_eq(&self.inner.run, run)
    }

    /// Re-apply the bound app's annotations to the task definition.
    ///
    /// Annotations are always applied to the original definition, so calling
    /// this repeatedly never stacks call wrappers.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Configuration`] when `RELAY_ANNOTATIONS` is malformed.
    pub fn annotate(&self) -> Result<(), ConfigError> {
        self.apply_annotations().map(|_| ())
    }

    pub(crate) fn clear_annotations(&self) {
        self.store_annotated(None);
    }

    fn apply_annotations(&self) -> Result<Annotated, ConfigError> {
        let app = self.app();
        let mut annotated = self.definition(app.id());
        for annotation in app.annotations_for(self.name())? {
            if annotation.queue.is_some() {
                annotated.queue = annotation.queue;
            }
            if annotation.exchange.is_some() {
                annotated.exchange = annotation.exchange;
            }
            if annotation.routing_key.is_some() {
                annotated.routing_key = annotation.routing_key;
            }
            if let Some(wrap) = &annotation.call {
                annotated.run = wrap(annotated.run);
            }
        }
        self.store_annotated(Some(annotated.clone()));
        Ok(annotated)
    }

    fn definition(&self, app_id: u64) -> Annotated {
        Annotated {
            app_id,
            run: Arc::clone(&self.inner.run),
            queue: self.inner.queue.clone(),
            exchange: self.inner.exchange.clone(),
            routing_key: self.inner.routing_key.clone(),
        }
    }

    fn store_annotated(&self, annotated: Option<Annotated>) {
        *self.inner.annotated.write().unwrap_or_else(PoisonError::into_inner) = annotated;
    }

    // Annotated definition for the current binding, computed on first use.
    fn annotated(&self) -> Annotated {
        let app_id = self.app().id();
        let cached = self
            .inner
            .annotated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|annotated| annotated.app_id == app_id);
        if let Some(annotated) = cached {
            return annotated;
        }

        self.apply_annotations().unwrap_or_else(|e| {
            warn!(task = %self.name(), error = %e, "Ignoring task annotations");
            let plain = self.definition(app_id);
            self.store_annotated(Some(plain.clone()));
            plain
        })
    }

    /// Queue the task is sent to when no other routing applies
    pub fn queue(&self) -> Option<String> {
        self.annotated().queue
    }

    pub fn is_bound_to(&self, app: &App) -> bool {
        self.bound_app().is_some_and(|bound| bound == *app)
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call the task body directly in this thread
    pub fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> anyhow::Result<Value> {
        let id = Uuid::new_v4().to_string();
        let mut request = Request::new(id.clone(), self.name());
        request.args = args.clone();
        request.kwargs = kwargs.clone();
        request.called_directly = true;

        let run = self.annotated().run;
        let _frame = FrameGuard::enter(ExecutionFrame::new(self.clone(), request));
        run(&Invocation {
            task: self.clone(),
            id,
            args,
            kwargs,
        })
    }

    /// Execute the task in this thread and return an eager result.
    ///
    /// Failures of the task body are captured in the result.
    pub fn apply(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        task_id: Option<String>,
    ) -> AsyncResult {
        let id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut request = Request::new(id.clone(), self.name());
        request.args = args.clone();
        request.kwargs = kwargs.clone();
        let frame = ExecutionFrame::new(self.clone(), request);
        let request = Arc::clone(&frame.request);
        let run = self.annotated().run;

        let outcome = {
            let _frame = FrameGuard::enter(frame);
            run(&Invocation {
                task: self.clone(),
                id: id.clone(),
                args,
                kwargs,
            })
        };

        let children = request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .children
            .clone();
        let outcome = outcome.map_err(|e| format!("{:#}", e));
        match &outcome {
            Ok(_) => debug!(task = %self.name(), task_id = %id, "Task executed eagerly"),
            Err(reason) => warn!(task = %self.name(), task_id = %id, error = %reason, "Eager task failed"),
        }
        AsyncResult::eager(id, self.name(), self.app(), outcome, children)
    }

    /// Dispatch the task.
    ///
    /// With `RELAY_ALWAYS_EAGER` the task runs in this thread; otherwise it is
    /// published through the bound app. Routing options left unset fall back
    /// to the task's annotations, then to the ones it was defined with.
    pub fn apply_async(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        mut options: SendOptions,
    ) -> Result<AsyncResult, AppError> {
        let app = self.app();
        if app.conf().get_bool("RELAY_ALWAYS_EAGER")? {
            let result = self.apply(args, kwargs, options.task_id.take());
            if let (Some(reason), true) = (
                result.error(),
                app.conf().get_bool("RELAY_EAGER_PROPAGATES_EXCEPTIONS")?,
            ) {
                return Err(TaskError::Failed {
                    task: self.name().to_string(),
                    reason: reason.to_string(),
                }
                .into());
            }
            if options.add_to_parent {
                attach_to_parent(&result);
            }
            return Ok(result);
        }

        let annotated = self.annotated();
        options.queue = options.queue.or(annotated.queue);
        options.exchange = options.exchange.or(annotated.exchange);
        options.routing_key = options.routing_key.or(annotated.routing_key);
        app.send_task(self.name(), args, kwargs, options)
    }

    /// Dispatch with positional arguments and default options
    pub fn delay(&self, args: Vec<Value>) -> Result<AsyncResult, AppError> {
        self.apply_async(args, Map::new(), SendOptions::default())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<@task: {}>", self.inner.name)
    }
}

/// Name to task mapping of one app (or several apps sharing it)
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<BTreeMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task`, returning the task it replaced
    pub fn register(&self, task: Task) -> Option<Task> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.name().to_string(), task)
    }

    pub fn unregister(&self, name: &str) -> Option<Task> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn get(&self, name: &str) -> Result<Task, TaskError> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::NotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRegistry").field(&self.names()).finish()
    }
}
