// Per-task overrides applied on top of a task's definition

use super::TaskFn;
use crate::errors::ConfigError;
use crate::settings::Settings;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Pattern matching every task
pub const MATCH_ALL: &str = "*";

/// Wraps a task body; receives the defined body and returns the one to run
pub type CallWrapper = Arc<dyn Fn(TaskFn) -> TaskFn + Send + Sync>;

/// Overrides for the tasks matching a name.
///
/// Routing fields come from `RELAY_ANNOTATIONS` or [`App::annotate`]; a call
/// wrapper can only be registered through [`App::annotate`].
///
/// [`App::annotate`]: crate::app::App::annotate
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Annotation {
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    #[serde(skip)]
    pub call: Option<CallWrapper>,
}

impl Annotation {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Wrap the task body, e.g. to observe every call
    pub fn wrap_call<F>(mut self, wrapper: F) -> Self
    where
        F: Fn(TaskFn) -> TaskFn + Send + Sync + 'static,
    {
        self.call = Some(Arc::new(wrapper));
        self
    }
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Annotation")
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("call", &self.call.is_some())
            .finish()
    }
}

/// Annotations declared in `RELAY_ANNOTATIONS`, in declaration order.
///
/// The setting is a mapping from task name (or `*`) to overrides, or a list
/// of such mappings.
pub fn from_settings(settings: &Settings) -> Result<Vec<(String, Annotation)>, ConfigError> {
    let mappings = match settings.get("RELAY_ANNOTATIONS")? {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        mapping @ Value::Object(_) => vec![mapping],
        other => return Err(malformed(&other)),
    };

    let mut annotations = Vec::new();
    for mapping in mappings {
        let entries = match mapping {
            Value::Object(entries) => entries,
            other => return Err(malformed(&other)),
        };
        for (pattern, overrides) in entries {
            let annotation = serde_json::from_value(overrides).map_err(|e| {
                ConfigError::Configuration(format!(
                    "RELAY_ANNOTATIONS entry for '{}' is invalid: {}",
                    pattern, e
                ))
            })?;
            annotations.push((pattern, annotation));
        }
    }
    Ok(annotations)
}

fn malformed(value: &Value) -> ConfigError {
    ConfigError::Configuration(format!(
        "RELAY_ANNOTATIONS must be a mapping or a list of mappings, got {}",
        value
    ))
}

/// Annotations that apply to `task`: `*` entries first, then exact matches
pub fn matching<'a, I>(annotations: I, task: &str) -> Vec<Annotation>
where
    I: IntoIterator<Item = &'a (String, Annotation)>,
    I::IntoIter: Clone,
{
    let annotations = annotations.into_iter();
    let wildcard = annotations
        .clone()
        .filter(|(pattern, _)| pattern == MATCH_ALL);
    let exact = annotations.filter(|(pattern, _)| pattern == task);
    wildcard.chain(exact).map(|(_, a)| a.clone()).collect()
}
