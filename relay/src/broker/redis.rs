// Redis broker transport
//
// Layout in Redis:
//   _relay.exchanges            hash  exchange -> kind
//   _relay.binding.<exchange>   set   "<routing_key>|<queue>"
//   <queue>                     list  JSON envelopes, LPUSH/RPOP

use super::transport::{Channel, Envelope, ExchangeKind, Transport};
use super::url::ConnectionInfo;
use crate::errors::BrokerError;
use redis::Client;
use tracing::{debug, info, instrument};

const EXCHANGES_KEY: &str = "_relay.exchanges";
const BINDING_PREFIX: &str = "_relay.binding.";
const BINDING_SEPARATOR: char = '|';
const DEFAULT_PORT: u16 = 6379;

/// Transport reaching a Redis server
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisTransport;

impl RedisTransport {
    /// Redis URL for the given connection parameters
    pub fn url_for(info: &ConnectionInfo) -> String {
        let db = info
            .virtual_host
            .trim_matches('/')
            .parse::<u32>()
            .unwrap_or(0);
        // guest/guest are the generic broker defaults, not Redis credentials
        let auth = if info.password == "guest" && info.userid == "guest" {
            String::new()
        } else {
            format!(":{}@", info.password)
        };
        format!(
            "redis://{}{}:{}/{}",
            auth,
            info.hostname,
            info.port.unwrap_or(DEFAULT_PORT),
            db
        )
    }
}

impl Transport for RedisTransport {
    fn name(&self) -> &str {
        "redis"
    }

    fn default_port(&self) -> Option<u16> {
        Some(DEFAULT_PORT)
    }

    #[instrument(skip(self, info), fields(broker = %info.as_uri()))]
    fn open(&self, info: &ConnectionInfo) -> Result<Box<dyn Channel>, BrokerError> {
        let client = Client::open(Self::url_for(info).as_str()).map_err(|e| {
            BrokerError::Connection(format!("Failed to create Redis client: {}", e))
        })?;
        let conn = match info.connect_timeout {
            Some(timeout) => client.get_connection_with_timeout(timeout),
            None => client.get_connection(),
        }
        .map_err(|e| BrokerError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        info!("Redis broker channel opened");
        Ok(Box::new(RedisChannel { conn: Some(conn) }))
    }
}

struct RedisChannel {
    conn: Option<redis::Connection>,
}

impl RedisChannel {
    fn conn(&mut self) -> Result<&mut redis::Connection, BrokerError> {
        self.conn
            .as_mut()
            .ok_or_else(|| BrokerError::Connection("channel is closed".to_string()))
    }
}

fn binding_member(routing_key: &str, queue: &str) -> String {
    format!("{}{}{}", routing_key, BINDING_SEPARATOR, queue)
}

impl Channel for RedisChannel {
    fn exchange_declare(
        &mut self,
        exchange: &str,
        kind: ExchangeKind,
        _durable: bool,
    ) -> Result<(), BrokerError> {
        redis::cmd("HSETNX")
            .arg(EXCHANGES_KEY)
            .arg(exchange)
            .arg(kind.as_str())
            .query::<()>(self.conn()?)?;
        Ok(())
    }

    // Redis lists exist once they hold a message.
    fn queue_declare(&mut self, _queue: &str, _durable: bool) -> Result<(), BrokerError> {
        self.conn()?;
        Ok(())
    }

    fn queue_bind(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        redis::cmd("SADD")
            .arg(format!("{}{}", BINDING_PREFIX, exchange))
            .arg(binding_member(routing_key, queue))
            .query::<()>(self.conn()?)?;
        Ok(())
    }

    fn publish(
        &mut self,
        envelope: &Envelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<usize, BrokerError> {
        let payload = serde_json::to_vec(envelope)?;
        let conn = self.conn()?;

        let queues: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let kind: Option<String> = redis::cmd("HGET")
                .arg(EXCHANGES_KEY)
                .arg(exchange)
                .query(&mut *conn)?;
            let kind: ExchangeKind = kind
                .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?
                .parse()?;
            let members: Vec<String> = redis::cmd("SMEMBERS")
                .arg(format!("{}{}", BINDING_PREFIX, exchange))
                .query(&mut *conn)?;
            let mut queues: Vec<String> = members
                .iter()
                .filter_map(|member| member.rsplit_once(BINDING_SEPARATOR))
                .filter(|(key, _)| kind.matches(key, routing_key))
                .map(|(_, queue)| queue.to_string())
                .collect();
            queues.sort();
            queues.dedup();
            queues
        };

        for queue in &queues {
            redis::cmd("LPUSH")
                .arg(queue)
                .arg(payload.as_slice())
                .query::<()>(&mut *conn)?;
        }
        debug!(exchange = %exchange, routing_key = %routing_key, delivered = queues.len(), "Pushed message to Redis");
        Ok(queues.len())
    }

    fn get(&mut self, queue: &str) -> Result<Option<Envelope>, BrokerError> {
        let payload: Option<Vec<u8>> = redis::cmd("RPOP").arg(queue).query(self.conn()?)?;
        payload
            .map(|bytes| serde_json::from_slice(&bytes).map_err(BrokerError::from))
            .transpose()
    }

    fn close(&mut self) {
        self.conn = None;
    }
}
