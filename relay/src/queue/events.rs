// Monitoring events emitted while publishing tasks

use crate::broker::{Connection, Envelope, ExchangeKind};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Exchange monitoring events are published to
pub const EVENT_EXCHANGE: &str = "relayev";

/// Sink for monitoring events such as `task-sent`
#[cfg_attr(test, mockall::automock)]
pub trait EventDispatcher: Send + Sync {
    /// Publish one event with the given fields
    fn publish(&self, event_type: &str, fields: &Map<String, Value>) -> anyhow::Result<()>;
}

/// Dispatcher publishing events to the `relayev` topic exchange.
///
/// The routing key is the event type with `-` replaced by `.`, so
/// `task-sent` is routed as `task.sent`.
pub struct BrokerEventDispatcher {
    connection: Mutex<Connection>,
    hostname: String,
}

impl BrokerEventDispatcher {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
            hostname: hostname(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }
}

impl EventDispatcher for BrokerEventDispatcher {
    fn publish(&self, event_type: &str, fields: &Map<String, Value>) -> anyhow::Result<()> {
        let mut event = fields.clone();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert("hostname".to_string(), Value::from(self.hostname.as_str()));
        event.insert(
            "timestamp".to_string(),
            Value::from(Utc::now().timestamp_micros() as f64 / 1e6),
        );

        let envelope = Envelope::json(serde_json::to_vec(&event)?);
        let routing_key = event_type.replace('-', ".");

        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = connection.channel()?;
        channel.exchange_declare(EVENT_EXCHANGE, ExchangeKind::Topic, true)?;
        channel.publish(&envelope, EVENT_EXCHANGE, &routing_key)?;
        debug!(event = %event_type, "Published monitoring event");
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
