// Sending tasks by name through the app's producer pool

use super::App;
use crate::broker::{Connection, ExchangeKind};
use crate::errors::{AppError, TaskError};
use crate::queue::{EventDispatcher, ProducerDefaults, PublishOptions, Router, TaskProducer};
use crate::task::{stack, AsyncResult};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, PoisonError};
use tracing::instrument;

/// Options for [`App::send_task`] and `Task::apply_async`
pub struct SendOptions {
    pub task_id: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub exchange_type: Option<ExchangeKind>,
    pub routing_key: Option<String>,
    /// Seconds from now before the task may run
    pub countdown: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub retries: u32,
    pub link: Vec<Value>,
    pub link_error: Vec<Value>,
    pub soft_time_limit: Option<f64>,
    pub time_limit: Option<f64>,
    pub reply_to: Option<String>,
    /// Append the result to the running task's children
    pub add_to_parent: bool,
    /// Publish over this connection instead of a pooled producer
    pub connection: Option<Connection>,
    pub event_dispatcher: Option<Arc<dyn EventDispatcher>>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            task_id: None,
            queue: None,
            exchange: None,
            exchange_type: None,
            routing_key: None,
            countdown: None,
            eta: None,
            expires: None,
            retries: 0,
            link: Vec::new(),
            link_error: Vec::new(),
            soft_time_limit: None,
            time_limit: None,
            reply_to: None,
            add_to_parent: true,
            connection: None,
            event_dispatcher: None,
        }
    }
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("task_id", &self.task_id)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("add_to_parent", &self.add_to_parent)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl SendOptions {
    /// Reject timings no broker message can carry
    pub fn validate(&self) -> Result<(), TaskError> {
        if let Some(countdown) = self.countdown {
            if !countdown.is_finite() || countdown < 0.0 {
                return Err(TaskError::InvalidOptions(format!(
                    "countdown must be a finite number of seconds >= 0, got {}",
                    countdown
                )));
            }
        }
        for (option, limit) in [
            ("soft_time_limit", self.soft_time_limit),
            ("time_limit", self.time_limit),
        ] {
            if let Some(limit) = limit.filter(|limit| !limit.is_finite() || *limit <= 0.0) {
                return Err(TaskError::InvalidOptions(format!(
                    "{} must be a positive number of seconds, got {}",
                    option, limit
                )));
            }
        }
        if let (Some(eta), Some(expires)) = (self.eta, self.expires) {
            if expires < eta {
                return Err(TaskError::InvalidOptions(format!(
                    "expires ({}) is before eta ({})",
                    expires, eta
                )));
            }
        }
        Ok(())
    }
}

impl App {
    /// Publish a task by name.
    ///
    /// Explicit options win over `RELAY_ROUTES`, which win over the producer
    /// defaults. When called from a running task the result is attached to
    /// it unless `add_to_parent` is false.
    ///
    /// # Arguments
    ///
    /// * `name` - Registered name of the task on the worker side
    /// * `args` - Positional arguments
    /// * `kwargs` - Keyword arguments
    /// * `options` - Routing, timing and connection overrides
    ///
    /// # Errors
    ///
    /// * [`TaskError::InvalidOptions`] when `options` fails [`SendOptions::validate`]
    /// * [`BrokerError`](crate::errors::BrokerError) when no destination can be
    ///   resolved, no producer is available or the broker rejects the message
    #[instrument(skip(self, args, kwargs, options), fields(app = %self.name(), task = %name))]
    pub fn send_task(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        mut options: SendOptions,
    ) -> Result<AsyncResult, AppError> {
        options.validate()?;
        let router = Router::from_settings(self.conf())?;
        if let Some(route) = router.route(name) {
            options.queue = options.queue.or_else(|| route.queue.clone());
            options.exchange = options.exchange.or_else(|| route.exchange.clone());
            options.exchange_type = options.exchange_type.or(route.exchange_type);
            options.routing_key = options.routing_key.or_else(|| route.routing_key.clone());
        }

        let parent_id = stack::current_request()
            .map(|request| request.lock().unwrap_or_else(PoisonError::into_inner).id.clone());
        let timelimit = match (options.soft_time_limit, options.time_limit) {
            (None, None) => None,
            limits => Some(limits),
        };
        let add_to_parent = options.add_to_parent;
        let connection = options.connection.take();
        let publish = PublishOptions {
            task_id: options.task_id,
            exchange: options.exchange,
            exchange_type: options.exchange_type,
            routing_key: options.routing_key,
            queue: options.queue,
            countdown: options.countdown,
            eta: options.eta,
            expires: options.expires,
            retries: options.retries,
            callbacks: options.link,
            errbacks: options.link_error,
            timelimit,
            parent_id,
            reply_to: options.reply_to,
            event_dispatcher: options.event_dispatcher,
        };

        let task_id = match connection {
            Some(connection) => {
                let defaults = ProducerDefaults::from_settings(self.conf())?;
                TaskProducer::with_defaults(connection, defaults)
                    .publish_task(name, args, kwargs, publish)?
            }
            None => self
                .producer_or_acquire(true)?
                .publish_task(name, args, kwargs, publish)?,
        };

        let result = AsyncResult::new(task_id, Some(name.to_string()), self.clone());
        if add_to_parent {
            stack::attach_to_parent(&result);
        }
        Ok(result)
    }
}
