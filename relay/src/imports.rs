// Process-wide module registry used for dotted-path lookups
//
// Configuration modules and task modules are registered under a dotted path
// (e.g. "proj.config", "proj.tasks"). Env-var indirection and task
// autodiscovery resolve names against this registry.

use crate::app::App;
use crate::errors::ConfigError;
use crate::settings::sources::public_settings;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::debug;

/// Callback that defines tasks on the given app
pub type TaskModule = Arc<dyn Fn(&App) + Send + Sync>;

#[derive(Default)]
struct Modules {
    config: HashMap<String, Map<String, Value>>,
    tasks: HashMap<String, TaskModule>,
}

fn modules() -> &'static Mutex<Modules> {
    static MODULES: OnceLock<Mutex<Modules>> = OnceLock::new();
    MODULES.get_or_init(|| Mutex::new(Modules::default()))
}

/// Register a configuration object under a dotted path.
///
/// Only public settings (upper-case keys not starting with `_`) are kept, the
/// same filter `config_from_object` applies.
pub fn register_config_module<T: Serialize>(path: &str, object: &T) -> Result<(), ConfigError> {
    let value = serde_json::to_value(object).map_err(|e| {
        ConfigError::Configuration(format!("config module '{}' is not serializable: {}", path, e))
    })?;
    let settings = match value {
        Value::Object(map) => public_settings(map),
        other => {
            return Err(ConfigError::Configuration(format!(
                "config module '{}' must serialize to a mapping, got {}",
                path, other
            )))
        }
    };
    debug!(path = %path, keys = settings.len(), "Registered configuration module");
    modules()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .config
        .insert(path.to_string(), settings);
    Ok(())
}

/// Look up a configuration module by dotted path
pub fn import_config(path: &str) -> Result<Map<String, Value>, ConfigError> {
    modules()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .config
        .get(path)
        .cloned()
        .ok_or_else(|| ConfigError::Import(path.to_string()))
}

/// Register a task module under a dotted path (e.g. "proj.tasks")
pub fn register_task_module<F>(path: &str, define: F)
where
    F: Fn(&App) + Send + Sync + 'static,
{
    modules()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .tasks
        .insert(path.to_string(), Arc::new(define));
}

/// Look up a task module by dotted path
pub fn import_task_module(path: &str) -> Option<TaskModule> {
    modules()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .tasks
        .get(path)
        .cloned()
}
