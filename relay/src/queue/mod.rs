// Task messages, routing and publishing

pub mod events;
pub mod message;
pub mod producer;
pub mod router;

pub use events::{BrokerEventDispatcher, EventDispatcher, EVENT_EXCHANGE};
pub use message::TaskMessage;
pub use producer::{
    countdown_eta, producer_pool, IdleProducer, PooledProducer, ProducerConnection,
    ProducerDefaults, ProducerPool, PublishOptions, TaskProducer, TASK_SENT_EVENT,
};
pub use router::{Route, Router};
