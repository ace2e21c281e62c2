// Connection and producer pools owned by an app, with fork detection

use super::{App, Pools};
use crate::broker::{connection_timeout, Connection, ConnectionInfo, ConnectionPool, PooledConnection};
use crate::errors::AppError;
use crate::queue::{producer_pool, PooledProducer, ProducerDefaults, ProducerPool};
use crate::telemetry;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Connection handed out by [`App::connection_or_acquire`].
///
/// Pooled connections go back to the pool on drop; fresh ones are closed.
#[derive(Debug)]
pub enum ConnectionGuard {
    Pooled(PooledConnection),
    Fresh(Connection),
}

impl Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            ConnectionGuard::Pooled(conn) => conn,
            ConnectionGuard::Fresh(conn) => conn,
        }
    }
}

impl DerefMut for ConnectionGuard {
    fn deref_mut(&mut self) -> &mut Connection {
        match self {
            ConnectionGuard::Pooled(conn) => conn,
            ConnectionGuard::Fresh(conn) => conn,
        }
    }
}

impl App {
    /// Unpooled connection; the transport is opened on first use.
    ///
    /// # Arguments
    ///
    /// * `url` - Broker URL overriding `BROKER_URL` and the `memory://` default
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the URL or a `BROKER_*` setting is malformed.
    pub fn connection(&self, url: Option<&str>) -> Result<Connection, AppError> {
        Ok(Connection::new(ConnectionInfo::resolve(url, self.conf())?))
    }

    /// The connection pool, created on first use.
    ///
    /// The pool holds at most `BROKER_POOL_LIMIT` connections (zero means
    /// unbounded) and blocking checkouts wait at most
    /// `BROKER_CONNECTION_TIMEOUT` seconds when it is set.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when either setting is invalid.
    pub fn pool(&self) -> Result<Arc<ConnectionPool>, AppError> {
        self.check_fork();
        let mut pools = self.lock_pools();
        self.connection_pool_in(&mut pools)
    }

    /// The producer pool, created on first use together with the connection pool
    pub fn producer_pool(&self) -> Result<Arc<ProducerPool>, AppError> {
        self.check_fork();
        let mut pools = self.lock_pools();
        if let Some(pool) = &pools.producers {
            return Ok(Arc::clone(pool));
        }

        let connections = self.connection_pool_in(&mut pools)?;
        let defaults = ProducerDefaults::from_settings(self.conf())?;
        let pool = producer_pool(connections, defaults);
        debug!(app = %self.name(), "Created producer pool");
        pools.producers = Some(Arc::clone(&pool));
        Ok(pool)
    }

    fn connection_pool_in(&self, pools: &mut Pools) -> Result<Arc<ConnectionPool>, AppError> {
        if let Some(pool) = &pools.connections {
            return Ok(Arc::clone(pool));
        }

        let conf = self.conf();
        let info = ConnectionInfo::resolve(None, conf)?;
        let limit = conf.get_u64("BROKER_POOL_LIMIT")?.unwrap_or(0) as usize;
        let timeout = connection_timeout(conf)?;
        let pool = ConnectionPool::connections(info, limit, timeout);
        debug!(app = %self.name(), limit, "Created connection pool");
        pools.connections = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// A pooled connection, or a fresh unpooled one.
    ///
    /// # Arguments
    ///
    /// * `pool` - Check the connection out of [`App::pool`]; otherwise open a new one
    /// * `block` - Wait for a free slot when the pool is exhausted
    ///
    /// # Errors
    ///
    /// [`BrokerError::PoolExhausted`](crate::errors::BrokerError::PoolExhausted)
    /// when the pool is full and `block` is false, or the wait timed out.
    pub fn connection_or_acquire(&self, pool: bool, block: bool) -> Result<ConnectionGuard, AppError> {
        if pool {
            Ok(ConnectionGuard::Pooled(self.pool()?.acquire(block)?))
        } else {
            Ok(ConnectionGuard::Fresh(self.connection(None)?))
        }
    }

    /// A producer from the producer pool.
    ///
    /// The producer checks a connection out of the connection pool for as
    /// long as it is held; `block` applies to both pools.
    pub fn producer_or_acquire(&self, block: bool) -> Result<PooledProducer, AppError> {
        Ok(self.producer_pool()?.acquire(block)?)
    }

    /// Force-close and forget both pools. Returns false when there was nothing to close.
    pub fn maybe_close_pool(&self) -> bool {
        let (connections, producers) = {
            let mut pools = self.lock_pools();
            (pools.connections.take(), pools.producers.take())
        };
        let closed = connections.is_some() || producers.is_some();
        if let Some(producers) = producers {
            producers.force_close_all();
        }
        if let Some(connections) = connections {
            connections.force_close_all();
        }
        if closed {
            debug!(app = %self.name(), "Closed broker pools");
        }
        closed
    }

    /// Discard pools inherited from a parent process
    pub fn after_fork(&self) {
        self.inner
            .owner_pid
            .store(std::process::id(), Ordering::Release);
        if self.maybe_close_pool() {
            info!(app = %self.name(), "Reset broker pools after fork");
        }
    }

    fn check_fork(&self) {
        self.detect_fork(std::process::id());
    }

    // Only the first caller that observes a new pid runs the cleanup.
    pub(crate) fn detect_fork(&self, pid: u32) -> bool {
        let owner = self.inner.owner_pid.load(Ordering::Acquire);
        if owner == pid {
            return false;
        }
        match self
            .inner
            .owner_pid
            .compare_exchange(owner, pid, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                warn!(app = %self.name(), parent = owner, pid, "Process fork detected");
                telemetry::record_fork_cleanup();
                self.maybe_close_pool();
                true
            }
            Err(_) => false,
        }
    }

    fn lock_pools(&self) -> MutexGuard<'_, Pools> {
        self.inner.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
