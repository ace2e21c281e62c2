// Process-wide task definitions bound into every app

use super::{AsyncResult, Invocation, Task, TaskFn, TaskOptions};
use crate::app::{registry, App, SendOptions};
use crate::errors::{AppError, TaskError};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{debug, warn};

#[derive(Clone)]
struct SharedDefinition {
    name: String,
    run: TaskFn,
    options: TaskOptions,
}

fn definitions() -> &'static Mutex<Vec<SharedDefinition>> {
    static DEFINITIONS: OnceLock<Mutex<Vec<SharedDefinition>>> = OnceLock::new();
    DEFINITIONS.get_or_init(|| Mutex::new(Vec::new()))
}

/// Define a task for every app.
///
/// Each finalized app gets its own instance now; apps constructed or
/// finalized later get one then. The returned handle resolves the instance
/// of whichever app is current at call time.
pub fn shared_task<F>(name: &str, run: F) -> SharedTask
where
    F: Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    register_definition(None, name.to_string(), Arc::new(run), TaskOptions::named(name))
}

/// Record a shared definition and bind it into every finalized app except
/// `defined_by`, which already holds its own instance.
pub(crate) fn register_definition(
    defined_by: Option<&App>,
    name: String,
    run: TaskFn,
    options: TaskOptions,
) -> SharedTask {
    let definition = SharedDefinition {
        name: name.clone(),
        run,
        options: TaskOptions {
            name: Some(name.clone()),
            shared: true,
            ..options
        },
    };

    {
        let mut definitions = definitions().lock().unwrap_or_else(PoisonError::into_inner);
        definitions.retain(|existing| existing.name != name);
        definitions.push(definition.clone());
    }

    for app in registry::active_apps() {
        if app.is_finalized() && defined_by != Some(&app) {
            bind_definition(&app, &definition);
        }
    }
    debug!(task = %name, "Registered shared task");
    SharedTask { name }
}

/// Names of every shared definition
pub fn shared_task_names() -> Vec<String> {
    definitions()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|definition| definition.name.clone())
        .collect()
}

/// Give `app` an instance of every shared definition
pub(crate) fn bind_shared_tasks(app: &App) {
    let snapshot = definitions()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for definition in &snapshot {
        bind_definition(app, definition);
    }
}

// A shared instance with a stale body is replaced; private tasks win over
// shared definitions of the same name.
fn bind_definition(app: &App, definition: &SharedDefinition) {
    match app.tasks().get(&definition.name) {
        Ok(existing) if !existing.is_shared() => {
            debug!(app = %app.name(), task = %definition.name, "Keeping private task");
        }
        Ok(existing) if existing.has_body(&definition.run) => existing.bind(app),
        Ok(_) => {
            warn!(app = %app.name(), task = %definition.name, "Shared task redefined");
            register_instance(app, definition);
        }
        Err(_) => register_instance(app, definition),
    }
}

fn register_instance(app: &App, definition: &SharedDefinition) {
    let task = Task::new(
        definition.name.clone(),
        Arc::clone(&definition.run),
        &definition.options,
    );
    task.bind(app);
    app.tasks().register(definition.options.apply_filter(task));
}

/// Handle to a shared task, resolved against the current app on every use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedTask {
    name: String,
}

impl SharedTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The app this handle currently resolves against
    pub fn app(&self) -> App {
        registry::current_app()
    }

    /// The current app's instance of this task
    pub fn resolve(&self) -> Result<Task, TaskError> {
        let app = registry::current_app();
        app.finalize();
        app.tasks().get(&self.name)
    }

    pub fn apply(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<AsyncResult, TaskError> {
        Ok(self.resolve()?.apply(args, kwargs, None))
    }

    pub fn apply_async(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: SendOptions,
    ) -> Result<AsyncResult, AppError> {
        self.resolve()?.apply_async(args, kwargs, options)
    }

    pub fn delay(&self, args: Vec<Value>) -> Result<AsyncResult, AppError> {
        self.apply_async(args, Map::new(), SendOptions::default())
    }
}
