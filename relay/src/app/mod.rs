// Application context: settings, task registry, broker pools and collaborators

pub mod command;
pub mod dispatch;
pub mod loader;
pub mod pools;
pub mod registry;
pub mod snapshot;

pub use command::WorkerCommand;
pub use dispatch::SendOptions;
pub use loader::{AdminMail, DefaultLoader, Loader};
pub use pools::ConnectionGuard;
pub use registry::{
    active_apps, current_app, default_app, disable_trace, enable_trace, set_default_app,
};
pub use snapshot::AppSnapshot;

use crate::broker::ConnectionPool;
use crate::errors::{AppError, ConfigError};
use crate::imports;
use crate::queue::ProducerPool;
use crate::settings::{parse_cmdline, DefaultsSource, Settings};
use crate::task::{
    self, annotations, shared, Annotation, AsyncResult, Invocation, Task, TaskFn, TaskOptions,
    TaskRegistry,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, instrument, warn};

/// Environment variable consulted for the broker URL when none is given
pub const BROKER_URL_ENV: &str = "RELAY_BROKER_URL";

#[derive(Default)]
struct Pools {
    connections: Option<Arc<ConnectionPool>>,
    producers: Option<Arc<ProducerPool>>,
}

pub(crate) struct AppInner {
    id: u64,
    main: Option<String>,
    name: String,
    settings: Settings,
    tasks: Arc<TaskRegistry>,
    loader: Arc<dyn Loader>,
    annotations: RwLock<Vec<(String, Annotation)>>,
    pools: Mutex<Pools>,
    owner_pid: AtomicU32,
    finalized: AtomicBool,
}

impl Drop for AppInner {
    fn drop(&mut self) {
        let pools = std::mem::take(
            self.pools.get_mut().unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(producers) = pools.producers {
            producers.force_close_all();
        }
        if let Some(connections) = pools.connections {
            connections.force_close_all();
        }
        debug!(app = %self.name, "App dropped");
    }
}

/// Handle to an application context. Clones refer to the same app.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    /// App with the given main name, set as current
    pub fn new(main: &str) -> Self {
        Self::builder().main(main).build()
    }

    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<AppInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<AppInner> {
        Arc::downgrade(&self.inner)
    }

    /// Process-unique identifier
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn main(&self) -> Option<&str> {
        self.inner.main.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn conf(&self) -> &Settings {
        &self.inner.settings
    }

    /// Whether the settings have been materialized
    pub fn configured(&self) -> bool {
        self.inner.settings.is_configured()
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    pub fn loader(&self) -> &Arc<dyn Loader> {
        &self.inner.loader
    }

    /// Make this the current app of the calling thread
    pub fn set_current(&self) {
        registry::set_current_app(self);
    }

    /// Task executing on the calling thread, if any
    pub fn current_task(&self) -> Option<Task> {
        task::current_task()
    }

    // Configuration

    pub fn add_defaults(&self, source: impl Into<DefaultsSource>) -> Result<(), AppError> {
        Ok(self.conf().add_defaults(source.into())?)
    }

    /// Add a default layer from the public settings of a serializable object
    pub fn config_from_object<T: Serialize + ?Sized>(&self, object: &T) -> Result<(), AppError> {
        self.add_defaults(DefaultsSource::from_object(object)?)
    }

    /// Add a default layer from a mapping.
    ///
    /// Like [`App::config_from_object`], only upper-case keys that do not
    /// start with an underscore are kept.
    pub fn config_from_dict(&self, settings: Map<String, Value>) -> Result<(), AppError> {
        self.add_defaults(DefaultsSource::Dict(settings))
    }

    /// Add a default layer read from a configuration file
    pub fn config_from_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        self.add_defaults(DefaultsSource::File(path.as_ref().to_path_buf()))
    }

    /// Add a default layer read from prefixed environment variables
    pub fn config_from_env(&self, prefix: &str) -> Result<(), AppError> {
        self.add_defaults(DefaultsSource::Environment {
            prefix: prefix.to_string(),
        })
    }

    /// Configure from the module or file named by an environment variable.
    ///
    /// The variable holds either a dotted path registered with
    /// [`imports::register_config_module`] or a path to a configuration file.
    ///
    /// # Arguments
    ///
    /// * `variable` - Name of the environment variable
    /// * `silent` - Return `Ok(false)` instead of failing when the variable
    ///   is unset or its target cannot be loaded
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the variable is unset, the target
    /// does not exist or the file cannot be parsed, unless `silent` is set.
    pub fn config_from_envvar(&self, variable: &str, silent: bool) -> Result<bool, AppError> {
        let target = match std::env::var(variable) {
            Ok(value) if !value.trim().is_empty() => value,
            _ if silent => return Ok(false),
            _ => {
                return Err(ConfigError::Configuration(format!(
                    "The environment variable {:?} is not set, and has to be set in order to \
                     configure the app",
                    variable
                ))
                .into())
            }
        };

        let source = match imports::import_config(&target) {
            Ok(settings) => DefaultsSource::Dict(settings),
            Err(_) if Path::new(&target).is_file() => DefaultsSource::File(target.clone().into()),
            Err(_) if silent => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        debug!(variable = %variable, target = %target, "Configuring from environment variable");
        self.add_defaults(source)?;
        Ok(true)
    }

    /// Apply `key=value` overrides to the changes layer.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Overrides such as `broker.pool_limit=10`; keys are
    ///   upper-cased with dots read as underscores
    /// * `namespace` - Prefix for keys written with a leading dot, as in
    ///   `.always_eager=yes`
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when a token is malformed or the settings
    /// cannot be materialized.
    pub fn config_from_cmdline<S: AsRef<str>>(
        &self,
        tokens: &[S],
        namespace: &str,
    ) -> Result<(), AppError> {
        let parsed = parse_cmdline(tokens, namespace)?;
        Ok(self.conf().update(parsed)?)
    }

    // Tasks

    /// Define a task from `function` declared in the entry module
    pub fn task<F>(&self, function: &str, run: F) -> Task
    where
        F: Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.task_with(function, TaskOptions::default(), run)
    }

    /// Define a task with explicit options.
    ///
    /// Shared tasks (the default) are also registered for every other app.
    /// When `options` carries a filter, the task it returns is the one
    /// registered and returned.
    ///
    /// # Arguments
    ///
    /// * `function` - Function name, qualified with the module (or the main
    ///   name) unless `options.name` is set
    /// * `options` - Naming, sharing, routing and filter options
    /// * `run` - The task body
    pub fn task_with<F>(&self, function: &str, options: TaskOptions, run: F) -> Task
    where
        F: Fn(&Invocation) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| task::task_name(self.main(), options.module.as_deref(), function));
        let run: TaskFn = Arc::new(run);

        let task = Task::new(name.clone(), Arc::clone(&run), &options);
        task.bind(self);
        let task = options.apply_filter(task);
        self.tasks().register(task.clone());
        if options.shared {
            shared::register_definition(Some(self), name.clone(), run, options);
        }
        debug!(app = %self.name(), task = %name, "Task defined");
        task
    }

    /// Register overrides for the tasks matching `pattern` (a task name or `*`).
    ///
    /// Programmatic annotations apply after the ones in `RELAY_ANNOTATIONS`
    /// and take effect on the next use of each matching task.
    pub fn annotate(&self, pattern: impl Into<String>, annotation: Annotation) {
        let pattern = pattern.into();
        debug!(app = %self.name(), pattern = %pattern, "Task annotation added");
        self.inner
            .annotations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pattern, annotation));
        for task in self.bound_tasks() {
            task.clear_annotations();
        }
    }

    /// Annotations that apply to the task named `task`, in the order they apply
    pub fn annotations_for(&self, task: &str) -> Result<Vec<Annotation>, ConfigError> {
        let configured = annotations::from_settings(self.conf())?;
        let programmatic = self
            .inner
            .annotations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matched = annotations::matching(&configured, task);
        matched.extend(annotations::matching(programmatic.iter(), task));
        Ok(matched)
    }

    fn bound_tasks(&self) -> Vec<Task> {
        self.tasks()
            .names()
            .iter()
            .filter_map(|name| self.tasks().get(name).ok())
            .filter(|task| task.is_bound_to(self))
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }

    /// Bind shared tasks, import the task modules listed in `RELAY_IMPORTS`
    /// and `RELAY_INCLUDE`, then annotate every task bound to this app.
    /// Runs once.
    #[instrument(skip(self), fields(app = %self.name()))]
    pub fn finalize(&self) {
        if self.inner.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        shared::bind_shared_tasks(self);
        for module in self.default_modules() {
            match imports::import_task_module(&module) {
                Some(define) => define(self),
                None => warn!(module = %module, "Task module is not registered"),
            }
        }
        for task in self.bound_tasks() {
            if let Err(e) = task.annotate() {
                warn!(task = %task.name(), error = %e, "Ignoring task annotations");
            }
        }
        debug!(tasks = self.tasks().len(), "App finalized");
    }

    fn default_modules(&self) -> Vec<String> {
        ["RELAY_IMPORTS", "RELAY_INCLUDE"]
            .iter()
            .flat_map(|key| match self.conf().get_as::<Option<Vec<String>>>(key) {
                Ok(modules) => modules.unwrap_or_default(),
                Err(e) => {
                    warn!(setting = %key, error = %e, "Ignoring malformed module list");
                    Vec::new()
                }
            })
            .collect()
    }

    /// Handle to a task by id
    pub fn async_result(&self, id: impl Into<String>) -> AsyncResult {
        AsyncResult::new(id, None, self.clone())
    }

    // Collaborators

    /// Import `<package>.<related_name>` task modules through the loader.
    ///
    /// # Errors
    ///
    /// Fails when a setting cannot be read or the loader cannot import a module.
    pub fn autodiscover_tasks<S: AsRef<str>>(
        &self,
        packages: &[S],
        related_name: &str,
    ) -> anyhow::Result<()> {
        if self.conf().get_bool("RELAY_FORCE_PROCESS_AWARE_LOGGING")? {
            self.loader().ensure_process_aware_logger()?;
        }
        let packages: Vec<String> = packages.iter().map(|p| p.as_ref().to_string()).collect();
        self.loader().autodiscover_tasks(self, &packages, related_name)
    }

    /// Send mail to `ADMINS`; does nothing when no admins are configured.
    ///
    /// Returns whether a message was handed to the mailer.
    ///
    /// # Errors
    ///
    /// Fails on malformed mail settings, or when delivery fails and
    /// `fail_silently` is not set.
    pub fn mail_admins(&self, subject: &str, body: &str, fail_silently: bool) -> anyhow::Result<bool> {
        let admins = match self.conf().get("ADMINS")? {
            Value::Null => Vec::new(),
            Value::Array(admins) => admins,
            other => anyhow::bail!("ADMINS must be a list, got {}", other),
        };
        let recipients: Vec<String> = admins.iter().filter_map(admin_address).collect();
        if recipients.is_empty() {
            return Ok(false);
        }

        let conf = self.conf();
        let mail = AdminMail {
            to: recipients,
            sender: conf.get_str("SERVER_EMAIL")?.unwrap_or_default(),
            subject: subject.to_string(),
            body: body.to_string(),
            host: conf.get_str("EMAIL_HOST")?.unwrap_or_default(),
            port: conf.get_u64("EMAIL_PORT")?.unwrap_or(25),
            user: conf.get_str("EMAIL_HOST_USER")?,
            password: conf.get_str("EMAIL_HOST_PASSWORD")?,
            timeout: conf.get_f64("EMAIL_TIMEOUT")?,
            use_ssl: conf.get_bool("EMAIL_USE_SSL")?,
            use_tls: conf.get_bool("EMAIL_USE_TLS")?,
            fail_silently,
        };
        self.loader().mail_admins(&mail)
    }

    /// Run a worker command with `argv` unchanged and return its output
    pub fn worker_main<W: WorkerCommand + ?Sized>(&self, command: &W, argv: &[String]) -> W::Output {
        info!(app = %self.name(), "Starting worker command");
        command.execute_from_commandline(self, argv)
    }

    /// Version and configuration summary for bug reports
    pub fn bugreport(&self) -> String {
        let transport = self
            .connection(None)
            .map(|conn| conn.transport_name().to_string())
            .unwrap_or_else(|e| format!("<{}>", e));
        let results = self
            .conf()
            .get_str("RELAY_RESULT_BACKEND")
            .ok()
            .flatten()
            .unwrap_or_else(|| "disabled".to_string());
        format!(
            "software -> relay:{} target:{}-{}\n\
             platform -> pid:{} app:{}\n\
             settings -> transport:{} results:{}\n\n{}\n",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::ARCH,
            std::env::consts::OS,
            std::process::id(),
            self.name(),
            transport,
            results,
            self.conf().humanize(),
        )
    }
}

// Admin entries are addresses or `[name, address]` pairs.
fn admin_address(entry: &Value) -> Option<String> {
    match entry {
        Value::String(address) => Some(address.clone()),
        Value::Array(pair) => pair.get(1).and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

impl PartialEq for App {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for App {}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<App {}:{:#x}>", self.name(), self.id())
    }
}

/// Builder for [`App`]
pub struct AppBuilder {
    main: Option<String>,
    name: Option<String>,
    broker: Option<String>,
    include: Vec<String>,
    changes: Map<String, Value>,
    sources: Vec<DefaultsSource>,
    set_as_current: bool,
    read_env: bool,
    tasks: Option<Arc<TaskRegistry>>,
    loader: Option<Arc<dyn Loader>>,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            main: None,
            name: None,
            broker: None,
            include: Vec::new(),
            changes: Map::new(),
            sources: Vec::new(),
            set_as_current: true,
            read_env: true,
            tasks: None,
            loader: None,
        }
    }

    /// Name used to qualify tasks declared in the entry module
    pub fn main(mut self, main: impl Into<String>) -> Self {
        self.main = Some(main.into());
        self
    }

    /// Display name; defaults to the main name or the executable name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Broker URL, stored as `BROKER_URL` in the changes layer
    pub fn broker(mut self, url: impl Into<String>) -> Self {
        self.broker = Some(url.into());
        self
    }

    /// Task modules to import on finalize, stored as `RELAY_IMPORTS`
    pub fn include<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(modules.into_iter().map(Into::into));
        self
    }

    /// Preset a value in the changes layer
    pub fn setting(mut self, key: &str, value: Value) -> Self {
        self.changes.insert(key.to_string(), value);
        self
    }

    pub fn changes(mut self, changes: Map<String, Value>) -> Self {
        self.changes.extend(changes);
        self
    }

    /// Queue a default layer, merged on first read
    pub fn config_source(mut self, source: impl Into<DefaultsSource>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn set_as_current(mut self, set_as_current: bool) -> Self {
        self.set_as_current = set_as_current;
        self
    }

    /// Whether to fall back to `RELAY_BROKER_URL` for the broker URL
    pub fn read_env(mut self, read_env: bool) -> Self {
        self.read_env = read_env;
        self
    }

    /// Share a task registry with other apps
    pub fn tasks(mut self, tasks: Arc<TaskRegistry>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> App {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let mut changes = self.changes;
        let broker = self.broker.or_else(|| {
            self.read_env
                .then(|| std::env::var(BROKER_URL_ENV).ok())
                .flatten()
                .filter(|url| !url.is_empty())
        });
        if let Some(broker) = broker {
            changes.insert("BROKER_URL".to_string(), Value::from(broker));
        }
        if !self.include.is_empty() {
            changes.insert("RELAY_IMPORTS".to_string(), Value::from(self.include));
        }

        let name = self
            .name
            .or_else(|| self.main.clone())
            .unwrap_or_else(executable_name);
        let app = App::from_inner(Arc::new(AppInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            main: self.main,
            name,
            settings: Settings::with_sources(changes, self.sources),
            tasks: self.tasks.unwrap_or_default(),
            loader: self.loader.unwrap_or_else(|| Arc::new(DefaultLoader)),
            annotations: RwLock::new(Vec::new()),
            pools: Mutex::new(Pools::default()),
            owner_pid: AtomicU32::new(std::process::id()),
            finalized: AtomicBool::new(false),
        }));

        registry::register(&app);
        if self.set_as_current {
            app.set_current();
        }
        shared::bind_shared_tasks(&app);
        info!(app = %app.name(), "App created");
        app
    }
}

fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "relay".to_string())
}
