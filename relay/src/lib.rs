// Application context for a distributed task-queue client

pub mod app;
pub mod broker;
pub mod errors;
pub mod imports;
pub mod mail;
pub mod queue;
pub mod settings;
pub mod task;
pub mod telemetry;

pub use app::{current_app, default_app, App, AppBuilder, SendOptions};
pub use errors::{AppError, BrokerError, ConfigError, TaskError};
pub use settings::{DefaultsSource, Settings};
pub use task::{
    shared_task, Annotation, AsyncResult, Invocation, SharedTask, Task, TaskOptions, TaskState,
};
