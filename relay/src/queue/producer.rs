// Task producer publishing task messages to the broker

use super::events::EventDispatcher;
use super::message::TaskMessage;
use crate::broker::{
    Connection, ConnectionPool, Envelope, ExchangeKind, Pool, Pooled, PooledConnection,
};
use crate::errors::{BrokerError, ConfigError};
use crate::settings::Settings;
use crate::telemetry;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Event emitted after a task message was published
pub const TASK_SENT_EVENT: &str = "task-sent";

/// Per-call publishing options. Fields left unset fall back to the producer defaults.
#[derive(Clone, Default)]
pub struct PublishOptions {
    pub task_id: Option<String>,
    pub exchange: Option<String>,
    pub exchange_type: Option<ExchangeKind>,
    pub routing_key: Option<String>,
    pub queue: Option<String>,
    pub countdown: Option<f64>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub retries: u32,
    pub callbacks: Vec<Value>,
    pub errbacks: Vec<Value>,
    pub timelimit: Option<(Option<f64>, Option<f64>)>,
    pub parent_id: Option<String>,
    pub reply_to: Option<String>,
    pub event_dispatcher: Option<Arc<dyn EventDispatcher>>,
}

impl fmt::Debug for PublishOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishOptions")
            .field("task_id", &self.task_id)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("eta", &self.eta)
            .field("expires", &self.expires)
            .field("retries", &self.retries)
            .field("event_dispatcher", &self.event_dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

/// Producer settings taken from the app configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerDefaults {
    pub exchange: String,
    pub exchange_type: ExchangeKind,
    pub routing_key: Option<String>,
    pub queue: Option<String>,
    pub delivery_mode: u8,
    pub create_missing_queues: bool,
    pub send_sent_event: bool,
    pub utc: bool,
}

impl Default for ProducerDefaults {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_type: ExchangeKind::Direct,
            routing_key: None,
            queue: None,
            delivery_mode: 2,
            create_missing_queues: true,
            send_sent_event: false,
            utc: true,
        }
    }
}

impl ProducerDefaults {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let exchange_type = settings
            .get_str("RELAY_DEFAULT_EXCHANGE_TYPE")?
            .map(|kind| kind.parse::<ExchangeKind>())
            .transpose()
            .map_err(|e| ConfigError::Configuration(e.to_string()))?
            .unwrap_or(ExchangeKind::Direct);
        let delivery_mode = settings
            .get_u64("RELAY_DEFAULT_DELIVERY_MODE")?
            .map(|mode| if mode == 1 { 1 } else { 2 })
            .unwrap_or(2);

        Ok(Self {
            exchange: settings.get_str("RELAY_DEFAULT_EXCHANGE")?.unwrap_or_default(),
            exchange_type,
            routing_key: settings.get_str("RELAY_DEFAULT_ROUTING_KEY")?,
            queue: settings.get_str("RELAY_DEFAULT_QUEUE")?,
            delivery_mode,
            create_missing_queues: settings.get_bool("RELAY_CREATE_MISSING_QUEUES")?,
            send_sent_event: settings.get_bool("RELAY_SEND_TASK_SENT_EVENT")?,
            utc: settings.get_bool("RELAY_ENABLE_UTC")?,
        })
    }
}

/// Connection a [`TaskProducer`] publishes through
pub trait ProducerConnection {
    fn connection_mut(&mut self) -> Result<&mut Connection, BrokerError>;
}

impl ProducerConnection for Connection {
    fn connection_mut(&mut self) -> Result<&mut Connection, BrokerError> {
        Ok(self)
    }
}

impl ProducerConnection for &mut Connection {
    fn connection_mut(&mut self) -> Result<&mut Connection, BrokerError> {
        Ok(&mut **self)
    }
}

impl ProducerConnection for PooledConnection {
    fn connection_mut(&mut self) -> Result<&mut Connection, BrokerError> {
        Ok(&mut **self)
    }
}

// Empty while the producer sits idle in a producer pool.
impl ProducerConnection for Option<PooledConnection> {
    fn connection_mut(&mut self) -> Result<&mut Connection, BrokerError> {
        self.as_deref_mut()
            .ok_or_else(|| BrokerError::Connection("producer holds no connection".to_string()))
    }
}

/// Publishes task messages over a connection.
///
/// `C` is anything that lends a [`Connection`]: an owned connection, a
/// borrowed one, or a [`PooledConnection`].
pub struct TaskProducer<C = PooledConnection> {
    connection: C,
    defaults: ProducerDefaults,
    declared: HashSet<String>,
}

impl<C: ProducerConnection> TaskProducer<C> {
    /// Producer with no default exchange or routing key
    pub fn new(connection: C) -> Self {
        Self::with_defaults(connection, ProducerDefaults::default())
    }

    pub fn with_defaults(connection: C, defaults: ProducerDefaults) -> Self {
        Self {
            connection,
            defaults,
            declared: HashSet::new(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, kind: ExchangeKind) -> Self {
        self.defaults.exchange = exchange.into();
        self.defaults.exchange_type = kind;
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.defaults.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_sent_event(mut self, enabled: bool) -> Self {
        self.defaults.send_sent_event = enabled;
        self
    }

    pub fn defaults(&self) -> &ProducerDefaults {
        &self.defaults
    }

    pub fn connection(&mut self) -> Result<&mut Connection, BrokerError> {
        self.connection.connection_mut()
    }

    /// Publish one task message and return its id.
    ///
    /// Destination resolution: an explicit `queue` is declared (with a
    /// direct exchange of the same name unless one is given) and used with
    /// its own name as routing key; otherwise `exchange` and `routing_key`
    /// fall back to the producer defaults. The `task-sent` event is emitted
    /// only after the broker accepted the message.
    ///
    /// # Errors
    ///
    /// [`BrokerError::Routing`] when no destination can be resolved,
    /// [`BrokerError::Publish`] when `countdown` is negative, not finite or
    /// too far in the future, and transport errors from the channel.
    #[instrument(skip(self, args, kwargs, options), fields(task = %name))]
    pub fn publish_task(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: PublishOptions,
    ) -> Result<String, BrokerError> {
        let (exchange, routing_key) = self.resolve_destination(&options)?;

        let task_id = options
            .task_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let eta = match (options.eta, options.countdown) {
            (Some(eta), _) => Some(eta),
            (None, Some(countdown)) => Some(countdown_eta(Utc::now(), countdown)?),
            (None, None) => None,
        };

        let mut message = TaskMessage::new(task_id.clone(), name);
        message.args = args;
        message.kwargs = kwargs;
        message.retries = options.retries;
        message.eta = eta;
        message.expires = options.expires;
        message.utc = self.defaults.utc;
        message.callbacks = options.callbacks.clone();
        message.errbacks = options.errbacks.clone();
        message.timelimit = options.timelimit;
        message.parent_id = options.parent_id.clone();

        let mut envelope = Envelope::json(serde_json::to_vec(&message)?);
        envelope.delivery_mode = self.defaults.delivery_mode;
        envelope.correlation_id = Some(task_id.clone());
        envelope.reply_to = options.reply_to.clone();
        envelope.headers.insert("task".to_string(), Value::from(name));
        envelope.headers.insert("id".to_string(), Value::from(task_id.as_str()));

        let delivered = self
            .connection
            .connection_mut()?
            .channel()?
            .publish(&envelope, &exchange, &routing_key)?;
        if delivered == 0 {
            warn!(exchange = %exchange, routing_key = %routing_key, "Message was not routed to any queue");
        }
        info!(task_id = %task_id, exchange = %exchange, routing_key = %routing_key, "Task published");
        telemetry::record_task_published(name);

        if self.defaults.send_sent_event {
            if let Some(dispatcher) = &options.event_dispatcher {
                let fields = sent_event_fields(&message, &exchange, &routing_key, &options);
                if let Err(e) = dispatcher.publish(TASK_SENT_EVENT, &fields) {
                    warn!(task_id = %task_id, error = %e, "Failed to emit task-sent event");
                    telemetry::record_event_failure(TASK_SENT_EVENT);
                }
            }
        }

        Ok(task_id)
    }

    fn resolve_destination(
        &mut self,
        options: &PublishOptions,
    ) -> Result<(String, String), BrokerError> {
        if let Some(queue) = &options.queue {
            let exchange = options.exchange.clone().unwrap_or_else(|| queue.clone());
            let routing_key = options.routing_key.clone().unwrap_or_else(|| queue.clone());
            let kind = options.exchange_type.unwrap_or(ExchangeKind::Direct);
            self.declare_queue(queue, &exchange, kind, &routing_key)?;
            return Ok((exchange, routing_key));
        }

        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.defaults.exchange.clone());
        let routing_key = options
            .routing_key
            .clone()
            .or_else(|| self.defaults.routing_key.clone())
            .ok_or_else(|| {
                BrokerError::Routing(format!(
                    "no queue or routing key for exchange '{}'",
                    exchange
                ))
            })?;

        let uses_defaults = options.exchange.is_none() && options.routing_key.is_none();
        if uses_defaults && self.defaults.create_missing_queues && !exchange.is_empty() {
            if let Some(queue) = self.defaults.queue.clone() {
                let kind = self.defaults.exchange_type;
                self.declare_queue(&queue, &exchange, kind, &routing_key)?;
            }
        }
        Ok((exchange, routing_key))
    }

    fn declare_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        kind: ExchangeKind,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let key = format!("{}/{}/{}", exchange, routing_key, queue);
        if self.declared.contains(&key) {
            return Ok(());
        }
        let channel = self.connection.connection_mut()?.channel()?;
        channel.exchange_declare(exchange, kind, true)?;
        channel.queue_declare(queue, true)?;
        channel.queue_bind(queue, exchange, routing_key)?;
        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Declared queue");
        self.declared.insert(key);
        Ok(())
    }
}

/// Time `countdown` seconds after `now`
pub fn countdown_eta(now: DateTime<Utc>, countdown: f64) -> Result<DateTime<Utc>, BrokerError> {
    let out_of_range =
        || BrokerError::Publish(format!("countdown of {} seconds is out of range", countdown));
    if !countdown.is_finite() || countdown < 0.0 {
        return Err(out_of_range());
    }
    let millis = countdown * 1000.0;
    if millis >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    TimeDelta::try_milliseconds(millis as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(out_of_range)
}

fn sent_event_fields(
    message: &TaskMessage,
    exchange: &str,
    routing_key: &str,
    options: &PublishOptions,
) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("uuid".to_string(), Value::from(message.id.as_str()));
    fields.insert("name".to_string(), Value::from(message.task.as_str()));
    fields.insert("args".to_string(), Value::from(message.args.clone()));
    fields.insert("kwargs".to_string(), Value::Object(message.kwargs.clone()));
    fields.insert("retries".to_string(), Value::from(message.retries));
    fields.insert(
        "eta".to_string(),
        message.eta.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null),
    );
    fields.insert(
        "expires".to_string(),
        message.expires.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null),
    );
    fields.insert("exchange".to_string(), Value::from(exchange));
    fields.insert("routing_key".to_string(), Value::from(routing_key));
    fields.insert(
        "queue".to_string(),
        options.queue.clone().map(Value::from).unwrap_or(Value::Null),
    );
    fields
}

impl<C> fmt::Debug for TaskProducer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskProducer")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Producer as kept by a [`ProducerPool`]
pub type IdleProducer = TaskProducer<Option<PooledConnection>>;

/// Pool of producers drawing connections from a [`ConnectionPool`]
pub type ProducerPool = Pool<IdleProducer>;

/// Producer checked out of a [`ProducerPool`]
pub type PooledProducer = Pooled<IdleProducer>;

/// Build a producer pool drawing connections from `connections`.
///
/// A producer takes a connection when it is checked out, waiting for one only
/// if the caller blocks, and hands it back when it is released. Idle producers
/// hold no connection.
pub fn producer_pool(connections: Arc<ConnectionPool>, defaults: ProducerDefaults) -> Arc<ProducerPool> {
    let limit = connections.limit();
    let timeout = connections.acquire_timeout();
    ProducerPool::with_lifecycle(
        "producers",
        limit,
        timeout,
        move || Ok(TaskProducer::with_defaults(None, defaults.clone())),
        move |producer: &mut IdleProducer, block| {
            if producer.connection.is_none() {
                producer.connection = Some(connections.acquire(block)?);
            }
            Ok(())
        },
        |producer: &mut IdleProducer| producer.connection = None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{memory_broker, ConnectionInfo};
    use crate::queue::events::MockEventDispatcher;
    use mockall::predicate::eq;

    fn memory_connection() -> Connection {
        Connection::new(ConnectionInfo::resolve(Some("memory://"), &Settings::new()).unwrap())
    }

    fn declare(conn: &mut Connection, queue: &str) {
        let channel = conn.channel().unwrap();
        channel.exchange_declare(queue, ExchangeKind::Direct, true).unwrap();
        channel.queue_declare(queue, true).unwrap();
        channel.queue_bind(queue, queue, queue).unwrap();
    }

    #[test]
    fn test_publish_to_default_destination() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-default");
        let mut producer = TaskProducer::new(&mut conn)
            .with_exchange("producer-tests-default", ExchangeKind::Direct)
            .with_routing_key("producer-tests-default");

        let id = producer
            .publish_task("proj.add", vec![Value::from(2), Value::from(2)], Map::new(), PublishOptions::default())
            .unwrap();

        let envelope = conn.channel().unwrap().get("producer-tests-default").unwrap().unwrap();
        let message: TaskMessage = envelope.decode().unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.task, "proj.add");
        assert_eq!(message.args, vec![Value::from(2), Value::from(2)]);
        assert_eq!(envelope.correlation_id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_explicit_task_id_and_countdown() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-eta");
        let mut producer = TaskProducer::new(&mut conn).with_routing_key("producer-tests-eta");

        let options = PublishOptions {
            task_id: Some("fixed-id".to_string()),
            exchange: Some("producer-tests-eta".to_string()),
            countdown: Some(60.0),
            ..PublishOptions::default()
        };
        let id = producer.publish_task("t", vec![], Map::new(), options).unwrap();
        assert_eq!(id, "fixed-id");

        let message: TaskMessage = conn
            .channel()
            .unwrap()
            .get("producer-tests-eta")
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert!(message.eta.unwrap() > Utc::now());
    }

    #[test]
    fn test_missing_routing_key_is_routing_error() {
        let mut conn = memory_connection();
        let mut producer = TaskProducer::new(&mut conn);
        let result = producer.publish_task("t", vec![], Map::new(), PublishOptions::default());
        assert!(matches!(result, Err(BrokerError::Routing(_))));
    }

    #[test]
    fn test_explicit_queue_is_declared() {
        let mut conn = memory_connection();
        let mut producer = TaskProducer::new(&mut conn);
        let options = PublishOptions {
            queue: Some("producer-tests-declared".to_string()),
            ..PublishOptions::default()
        };
        producer.publish_task("t", vec![], Map::new(), options).unwrap();
        assert!(memory_broker().has_exchange("producer-tests-declared"));
        assert_eq!(memory_broker().queue_len("producer-tests-declared"), 1);
    }

    #[test]
    fn test_sent_event_uses_call_overrides_only() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-ev-a");
        declare(&mut conn, "producer-tests-ev-b");

        let mut dispatcher = MockEventDispatcher::new();
        dispatcher
            .expect_publish()
            .with(eq(TASK_SENT_EVENT), mockall::predicate::always())
            .times(2)
            .returning(|_, fields| {
                assert!(fields.contains_key("uuid"));
                assert!(fields.contains_key("routing_key"));
                Ok(())
            });
        let dispatcher: Arc<dyn EventDispatcher> = Arc::new(dispatcher);

        let mut producer = TaskProducer::new(&mut conn)
            .with_exchange("producer-tests-ev-a", ExchangeKind::Direct)
            .with_routing_key("producer-tests-ev-a")
            .with_sent_event(true);

        let overridden = PublishOptions {
            exchange: Some("producer-tests-ev-b".to_string()),
            routing_key: Some("producer-tests-ev-b".to_string()),
            event_dispatcher: Some(Arc::clone(&dispatcher)),
            ..PublishOptions::default()
        };
        producer.publish_task("t", vec![], Map::new(), overridden).unwrap();
        assert_eq!(producer.defaults().exchange, "producer-tests-ev-a");
        assert_eq!(producer.defaults().routing_key.as_deref(), Some("producer-tests-ev-a"));

        let plain = PublishOptions {
            event_dispatcher: Some(dispatcher),
            ..PublishOptions::default()
        };
        producer.publish_task("t", vec![], Map::new(), plain).unwrap();

        assert_eq!(memory_broker().queue_len("producer-tests-ev-a"), 1);
        assert_eq!(memory_broker().queue_len("producer-tests-ev-b"), 1);
    }

    #[test]
    fn test_dispatcher_failure_is_not_propagated() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-ev-fail");
        let mut dispatcher = MockEventDispatcher::new();
        dispatcher
            .expect_publish()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("event bus down")));

        let mut producer = TaskProducer::new(&mut conn)
            .with_routing_key("producer-tests-ev-fail")
            .with_sent_event(true);
        let options = PublishOptions {
            exchange: Some("producer-tests-ev-fail".to_string()),
            event_dispatcher: Some(Arc::new(dispatcher)),
            ..PublishOptions::default()
        };
        assert!(producer.publish_task("t", vec![], Map::new(), options).is_ok());
    }

    #[test]
    fn test_no_event_when_disabled() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-ev-off");
        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_publish().times(0);

        let mut producer = TaskProducer::new(&mut conn).with_routing_key("producer-tests-ev-off");
        let options = PublishOptions {
            exchange: Some("producer-tests-ev-off".to_string()),
            event_dispatcher: Some(Arc::new(dispatcher)),
            ..PublishOptions::default()
        };
        producer.publish_task("t", vec![], Map::new(), options).unwrap();
    }

    #[test]
    fn test_failed_publish_emits_no_event() {
        let mut conn = memory_connection();
        let mut dispatcher = MockEventDispatcher::new();
        dispatcher.expect_publish().times(0);

        let mut producer = TaskProducer::new(&mut conn)
            .with_exchange("producer-tests-undeclared", ExchangeKind::Direct)
            .with_routing_key("x")
            .with_sent_event(true);
        let options = PublishOptions {
            event_dispatcher: Some(Arc::new(dispatcher)),
            ..PublishOptions::default()
        };
        assert!(producer.publish_task("t", vec![], Map::new(), options).is_err());
    }

    #[test]
    fn test_countdown_eta_bounds() {
        let now = Utc::now();
        assert_eq!(
            countdown_eta(now, 1.5).unwrap(),
            now + TimeDelta::milliseconds(1500)
        );
        for countdown in [1e300, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                countdown_eta(now, countdown),
                Err(BrokerError::Publish(_))
            ));
        }
    }

    #[test]
    fn test_huge_countdown_is_publish_error() {
        let mut conn = memory_connection();
        declare(&mut conn, "producer-tests-huge-eta");
        let mut producer = TaskProducer::new(&mut conn).with_routing_key("producer-tests-huge-eta");
        let options = PublishOptions {
            exchange: Some("producer-tests-huge-eta".to_string()),
            countdown: Some(1e300),
            ..PublishOptions::default()
        };
        assert!(matches!(
            producer.publish_task("t", vec![], Map::new(), options),
            Err(BrokerError::Publish(_))
        ));
        assert_eq!(memory_broker().queue_len("producer-tests-huge-eta"), 0);
    }

    fn pools(limit: usize) -> (Arc<ConnectionPool>, Arc<ProducerPool>) {
        let info = ConnectionInfo::resolve(Some("memory://"), &Settings::new()).unwrap();
        let connections = ConnectionPool::connections(info, limit, None);
        let producers = producer_pool(Arc::clone(&connections), ProducerDefaults::default());
        (connections, producers)
    }

    #[test]
    fn test_producer_pool_shares_connection_limit() {
        let (connections, producers) = pools(1);

        let producer = producers.acquire(false).unwrap();
        assert!(connections.is_dirty());
        assert!(matches!(
            producers.acquire(false),
            Err(BrokerError::PoolExhausted { limit: 1 })
        ));
        drop(producer);
        assert!(producers.acquire(false).is_ok());
    }

    #[test]
    fn test_idle_producer_releases_its_connection() {
        let (connections, producers) = pools(1);

        let mut producer = producers.acquire(false).unwrap();
        assert!(producer.connection().is_ok());
        drop(producer);
        assert_eq!(producers.idle(), 1);
        assert!(!connections.is_dirty());

        let held = connections.acquire(false).unwrap();
        assert!(matches!(
            producers.acquire(false),
            Err(BrokerError::PoolExhausted { limit: 1 })
        ));
        assert_eq!(producers.idle(), 1);
        drop(held);

        let mut producer = producers.acquire(false).unwrap();
        assert!(producer.connection().is_ok());
        assert!(connections.is_dirty());
    }

    #[test]
    fn test_blocking_producer_acquire_waits_for_connection() {
        let (connections, producers) = pools(1);
        let held = connections.acquire(false).unwrap();

        let waiter = std::thread::spawn(move || {
            let mut producer = producers.acquire(true).unwrap();
            producer.connection().is_ok()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
