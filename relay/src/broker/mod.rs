// Broker connections, transports and pools

pub mod connection;
pub mod memory;
pub mod pool;
pub mod redis;
pub mod transport;
pub mod url;

pub use connection::Connection;
pub use memory::{memory_broker, MemoryBroker, MemoryTransport};
pub use pool::{ConnectionPool, Pool, Pooled, PooledConnection};
pub use self::redis::RedisTransport;
pub use transport::{get_transport, register_transport, Channel, Envelope, ExchangeKind, Transport};
pub use url::{connection_timeout, BrokerUrl, ConnectionInfo, DEFAULT_TRANSPORT};
