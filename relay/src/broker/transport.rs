// Transport abstraction and the process-wide transport registry

use super::memory::MemoryTransport;
use super::redis::RedisTransport;
use super::url::ConnectionInfo;
use crate::errors::BrokerError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::info;

/// How an exchange routes messages to bound queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }

    /// Whether a binding with `binding_key` receives a message sent with `routing_key`
    pub fn matches(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => {
                let pattern: Vec<&str> = binding_key.split('.').collect();
                let words: Vec<&str> = routing_key.split('.').collect();
                topic_matches(&pattern, &words)
            }
        }
    }
}

// `*` matches exactly one word, `#` matches zero or more.
fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.split_first(), words.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, words) || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some((&"*", rest)), Some((_, remaining))) => topic_matches(rest, remaining),
        (Some((head, rest)), Some((word, remaining))) => {
            head == word && topic_matches(rest, remaining)
        }
        _ => false,
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(BrokerError::Routing(format!("unsupported exchange type '{}'", other))),
        }
    }
}

/// A message as handed to a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub body: Vec<u8>,
    pub content_type: String,
    pub content_encoding: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    pub delivery_mode: u8,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl Envelope {
    /// Wrap a JSON body
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
            headers: Map::new(),
            delivery_mode: 2,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Decode the body as JSON
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, BrokerError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// An open channel to a broker
pub trait Channel: Send {
    fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    fn queue_declare(&mut self, queue: &str, durable: bool) -> Result<(), BrokerError>;

    fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    /// Publish a message; returns the number of queues it was delivered to
    fn publish(
        &mut self,
        envelope: &Envelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<usize, BrokerError>;

    /// Take the oldest message from a queue
    fn get(&mut self, queue: &str) -> Result<Option<Envelope>, BrokerError>;

    fn close(&mut self);
}

/// A named way of reaching a broker
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn default_port(&self) -> Option<u16> {
        None
    }

    fn open(&self, info: &ConnectionInfo) -> Result<Box<dyn Channel>, BrokerError>;
}

type Transports = RwLock<HashMap<String, Arc<dyn Transport>>>;

fn transports() -> &'static Transports {
    static TRANSPORTS: OnceLock<Transports> = OnceLock::new();
    TRANSPORTS.get_or_init(|| {
        let mut builtin: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        builtin.insert("memory".to_string(), Arc::new(MemoryTransport::shared()));
        builtin.insert("redis".to_string(), Arc::new(RedisTransport));
        RwLock::new(builtin)
    })
}

/// Register (or replace) a transport under its name
pub fn register_transport(transport: Arc<dyn Transport>) {
    let name = transport.name().to_string();
    info!(transport = %name, "Registered broker transport");
    transports()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(name, transport);
}

/// Look up a transport by name
pub fn get_transport(name: &str) -> Result<Arc<dyn Transport>, BrokerError> {
    transports()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| BrokerError::UnknownTransport(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_and_fanout_matching() {
        assert!(ExchangeKind::Direct.matches("relay", "relay"));
        assert!(!ExchangeKind::Direct.matches("relay", "other"));
        assert!(ExchangeKind::Fanout.matches("", "anything"));
    }

    #[test]
    fn test_topic_matching() {
        let topic = ExchangeKind::Topic;
        assert!(topic.matches("task.*", "task.sent"));
        assert!(!topic.matches("task.*", "task.sent.extra"));
        assert!(topic.matches("task.#", "task.sent.extra"));
        assert!(topic.matches("#", "worker.heartbeat"));
        assert!(topic.matches("#.sent", "task.sent"));
        assert!(!topic.matches("worker.*", "task.sent"));
    }

    #[test]
    fn test_exchange_kind_parsing() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert!(matches!(
            "headers".parse::<ExchangeKind>(),
            Err(BrokerError::Routing(_))
        ));
    }

    #[test]
    fn test_builtin_transports() {
        assert_eq!(get_transport("memory").unwrap().name(), "memory");
        assert_eq!(get_transport("redis").unwrap().default_port(), Some(6379));
        assert!(matches!(
            get_transport("asd"),
            Err(BrokerError::UnknownTransport(name)) if name == "asd"
        ));
    }
}
