// In-process broker transport

use super::transport::{Channel, Envelope, ExchangeKind, Transport};
use super::url::ConnectionInfo;
use crate::errors::BrokerError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<Envelope>>,
}

/// Exchanges, bindings and queues kept in memory.
///
/// Publishing to the nameless exchange delivers straight to the queue named by
/// the routing key.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Number of messages waiting in `queue`
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Drop every message in `queue`, returning how many were removed
    pub fn purge(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get_mut(queue)
            .map_or(0, |messages| messages.drain(..).count())
    }

    fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let mut state = self.lock();
        match state.exchanges.get(exchange) {
            Some(existing) if *existing != kind => Err(BrokerError::Routing(format!(
                "exchange '{}' already declared as {}",
                exchange, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), kind);
                Ok(())
            }
        }
    }

    fn declare_queue(&self, queue: &str) {
        self.lock().queues.entry(queue.to_string()).or_default();
    }

    fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Routing(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Routing(format!("no queue '{}'", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    fn deliver(
        &self,
        envelope: &Envelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<usize, BrokerError> {
        let mut state = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default()
        } else {
            let kind = *state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && kind.matches(&b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        for queue in &targets {
            state
                .queues
                .entry(queue.clone())
                .or_default()
                .push_back(envelope.clone());
        }
        debug!(exchange = %exchange, routing_key = %routing_key, delivered = targets.len(), "Delivered message");
        Ok(targets.len())
    }

    fn take(&self, queue: &str) -> Option<Envelope> {
        self.lock().queues.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

/// Transport over a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    /// Transport over a private broker
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    /// Transport over the broker shared by the whole process
    pub fn shared() -> Self {
        Self::new(memory_broker())
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

/// The broker behind `memory://` connections
pub fn memory_broker() -> Arc<MemoryBroker> {
    static BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();
    BROKER.get_or_init(|| Arc::new(MemoryBroker::new())).clone()
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, _info: &ConnectionInfo) -> Result<Box<dyn Channel>, BrokerError> {
        Ok(Box::new(MemoryChannel {
            broker: Arc::clone(&self.broker),
            closed: false,
        }))
    }
}

struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    closed: bool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed {
            Err(BrokerError::Connection("channel is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Channel for MemoryChannel {
    fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_exchange(exchange, kind)
    }

    fn queue_declare(&mut self, queue: &str, _durable: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.declare_queue(queue);
        Ok(())
    }

    fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.bind(queue, exchange, routing_key)
    }

    fn publish(
        &mut self,
        envelope: &Envelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<usize, BrokerError> {
        self.ensure_open()?;
        self.broker.deliver(envelope, exchange, routing_key)
    }

    fn get(&mut self, queue: &str) -> Result<Option<Envelope>, BrokerError> {
        self.ensure_open()?;
        Ok(self.broker.take(queue))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn channel(broker: &Arc<MemoryBroker>) -> Box<dyn Channel> {
        let info = ConnectionInfo::resolve(Some("memory://"), &Settings::new()).unwrap();
        MemoryTransport::new(Arc::clone(broker)).open(&info).unwrap()
    }

    #[test]
    fn test_direct_routing() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        chan.exchange_declare("tasks", ExchangeKind::Direct, true).unwrap();
        chan.queue_declare("default", true).unwrap();
        chan.queue_bind("default", "tasks", "default").unwrap();

        let delivered = chan
            .publish(&Envelope::json(b"{}".to_vec()), "tasks", "default")
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(broker.queue_len("default"), 1);

        let delivered = chan
            .publish(&Envelope::json(b"{}".to_vec()), "tasks", "elsewhere")
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(chan.get("default").unwrap().is_some());
        assert!(chan.get("default").unwrap().is_none());
    }

    #[test]
    fn test_fanout_and_topic_routing() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        chan.exchange_declare("events", ExchangeKind::Topic, true).unwrap();
        chan.exchange_declare("broadcast", ExchangeKind::Fanout, true).unwrap();
        for queue in ["a", "b"] {
            chan.queue_declare(queue, true).unwrap();
            chan.queue_bind(queue, "broadcast", "").unwrap();
        }
        chan.queue_bind("a", "events", "task.#").unwrap();

        let env = Envelope::json(b"1".to_vec());
        assert_eq!(chan.publish(&env, "broadcast", "ignored").unwrap(), 2);
        assert_eq!(chan.publish(&env, "events", "task.sent").unwrap(), 1);
        assert_eq!(broker.queue_len("a"), 2);
        assert_eq!(broker.queue_len("b"), 1);
        assert_eq!(broker.purge("a"), 2);
    }

    #[test]
    fn test_default_exchange_routes_by_queue_name() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        chan.queue_declare("direct-q", false).unwrap();
        assert_eq!(chan.publish(&Envelope::json(vec![]), "", "direct-q").unwrap(), 1);
        assert_eq!(chan.publish(&Envelope::json(vec![]), "", "missing").unwrap(), 0);
    }

    #[test]
    fn test_undeclared_exchange_fails() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        let result = chan.publish(&Envelope::json(vec![]), "nope", "x");
        assert!(matches!(result, Err(BrokerError::Publish(_))));
    }

    #[test]
    fn test_conflicting_exchange_kind() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        chan.exchange_declare("x", ExchangeKind::Direct, true).unwrap();
        assert!(chan.exchange_declare("x", ExchangeKind::Topic, true).is_err());
    }

    #[test]
    fn test_closed_channel_rejects_operations() {
        let broker = Arc::new(MemoryBroker::new());
        let mut chan = channel(&broker);
        chan.close();
        assert!(matches!(
            chan.queue_declare("q", true),
            Err(BrokerError::Connection(_))
        ));
    }
}
