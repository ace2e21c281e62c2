// Bounded resource pools for broker connections and producers

use super::connection::Connection;
use super::url::ConnectionInfo;
use crate::errors::BrokerError;
use crate::telemetry;
use std::borrow::{Borrow, BorrowMut};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Factory<T> = Box<dyn Fn() -> Result<T, BrokerError> + Send + Sync>;
type Prepare<T> = Box<dyn Fn(&mut T, bool) -> Result<(), BrokerError> + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    /// Members currently handed out
    dirty: usize,
    /// Bumped by `force_close_all`; members from older generations are dropped on release
    generation: u64,
}

/// A bounded pool of reusable resources.
///
/// A `limit` of zero means unbounded. Members are created on demand by the
/// factory and returned to the pool when their [`Pooled`] guard drops.
/// Optional lifecycle hooks run on every checkout (`prepare`, told whether
/// the caller may block) and on every release (`reset`), outside the pool lock.
pub struct Pool<T> {
    name: &'static str,
    limit: usize,
    acquire_timeout: Option<Duration>,
    factory: Factory<T>,
    prepare: Option<Prepare<T>>,
    reset: Option<Reset<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

/// Pool of broker connections
pub type ConnectionPool = Pool<Connection>;

/// Connection checked out of a [`ConnectionPool`]
pub type PooledConnection = Pooled<Connection>;

impl<T: Send + 'static> Pool<T> {
    pub fn new<F>(name: &'static str, limit: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, BrokerError> + Send + Sync + 'static,
    {
        Self::with_timeout(name, limit, None, factory)
    }

    pub fn with_timeout<F>(
        name: &'static str,
        limit: usize,
        acquire_timeout: Option<Duration>,
        factory: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Result<T, BrokerError> + Send + Sync + 'static,
    {
        Arc::new(Self::build(name, limit, acquire_timeout, Box::new(factory), None, None))
    }

    /// Pool whose members are prepared on checkout and reset on release.
    ///
    /// # Arguments
    ///
    /// * `prepare` - Runs outside the pool lock on every checkout, with the
    ///   caller's `block` flag
    /// * `reset` - Runs when a member is released, before it becomes idle
    pub fn with_lifecycle<F, P, R>(
        name: &'static str,
        limit: usize,
        acquire_timeout: Option<Duration>,
        factory: F,
        prepare: P,
        reset: R,
    ) -> Arc<Self>
    where
        F: Fn() -> Result<T, BrokerError> + Send + Sync + 'static,
        P: Fn(&mut T, bool) -> Result<(), BrokerError> + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Arc::new(Self::build(
            name,
            limit,
            acquire_timeout,
            Box::new(factory),
            Some(Box::new(prepare)),
            Some(Box::new(reset)),
        ))
    }

    fn build(
        name: &'static str,
        limit: usize,
        acquire_timeout: Option<Duration>,
        factory: Factory<T>,
        prepare: Option<Prepare<T>>,
        reset: Option<Reset<T>>,
    ) -> Self {
        Self {
            name,
            limit,
            acquire_timeout,
            factory,
            prepare,
            reset,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                dirty: 0,
                generation: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout
    }

    /// Whether any member is currently checked out
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty > 0
    }

    pub fn in_use(&self) -> usize {
        self.lock().dirty
    }

    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    /// Check out a member.
    ///
    /// When the pool is exhausted a non-blocking acquire fails immediately
    /// with [`BrokerError::PoolExhausted`]; a blocking one waits for a release
    /// (up to the acquire timeout, if any).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PoolExhausted`] when no member is available in
    /// time, or the error of the factory or the prepare hook. A member whose
    /// preparation fails goes back to the pool.
    pub fn acquire(self: &Arc<Self>, block: bool) -> Result<Pooled<T>, BrokerError> {
        let deadline = self.acquire_timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();

        loop {
            if let Some(item) = state.idle.pop() {
                state.dirty += 1;
                let generation = state.generation;
                telemetry::update_pool_in_use(self.name, state.dirty);
                drop(state);
                return self.prepared(self.guard(item, generation), block);
            }

            if self.limit == 0 || state.dirty < self.limit {
                state.dirty += 1;
                let generation = state.generation;
                telemetry::update_pool_in_use(self.name, state.dirty);
                drop(state);
                return self
                    .create(generation)
                    .and_then(|member| self.prepared(member, block));
            }

            if !block {
                return Err(BrokerError::PoolExhausted { limit: self.limit });
            }

            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(pool = self.name, limit = self.limit, "Timed out waiting for pool member");
                        return Err(BrokerError::PoolExhausted { limit: self.limit });
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    // Runs without the lock held; the slot is already reserved.
    fn create(self: &Arc<Self>, generation: u64) -> Result<Pooled<T>, BrokerError> {
        match (self.factory)() {
            Ok(item) => {
                debug!(pool = self.name, "Created pool member");
                Ok(self.guard(item, generation))
            }
            Err(e) => {
                let mut state = self.lock();
                if state.generation == generation {
                    state.dirty = state.dirty.saturating_sub(1);
                }
                self.available.notify_one();
                Err(e)
            }
        }
    }

    // A member that fails to prepare goes back to the pool when dropped.
    fn prepared(&self, mut member: Pooled<T>, block: bool) -> Result<Pooled<T>, BrokerError> {
        if let Some(prepare) = &self.prepare {
            prepare(&mut *member, block)?;
        }
        Ok(member)
    }

    fn guard(self: &Arc<Self>, item: T, generation: u64) -> Pooled<T> {
        Pooled {
            item: Some(item),
            pool: Arc::clone(self),
            generation,
        }
    }

    fn release(&self, mut item: T, generation: u64) {
        if let Some(reset) = &self.reset {
            reset(&mut item);
        }
        let mut state = self.lock();
        if state.generation != generation {
            drop(state);
            drop(item);
            return;
        }
        state.dirty = state.dirty.saturating_sub(1);
        state.idle.push(item);
        telemetry::update_pool_in_use(self.name, state.dirty);
        drop(state);
        self.available.notify_one();
    }

    /// Drop every idle member and forget the checked-out ones.
    ///
    /// Members still checked out are dropped instead of returned when released.
    pub fn force_close_all(&self) {
        let idle = {
            let mut state = self.lock();
            state.generation += 1;
            state.dirty = 0;
            telemetry::update_pool_in_use(self.name, 0);
            std::mem::take(&mut state.idle)
        };
        debug!(pool = self.name, closed = idle.len(), "Force-closed pool");
        drop(idle);
        self.available.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionPool {
    /// Pool of connections to the broker described by `info`
    pub fn connections(
        info: ConnectionInfo,
        limit: usize,
        acquire_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::with_timeout("connections", limit, acquire_timeout, move || {
            Ok(Connection::new(info.clone()))
        })
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// A member checked out of a [`Pool`]; returned to the pool on drop
pub struct Pooled<T: Send + 'static> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
    generation: u64,
}

impl<T: Send + 'static> Pooled<T> {
    pub fn pool(&self) -> &Arc<Pool<T>> {
        &self.pool
    }
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T: Send + 'static> Borrow<T> for Pooled<T> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T: Send + 'static> BorrowMut<T> for Pooled<T> {
    fn borrow_mut(&mut self) -> &mut T {
        self
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item, self.generation);
        }
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_pool(limit: usize) -> (Arc<Pool<usize>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::new("test", limit, move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        (pool, created)
    }

    #[test]
    fn test_members_are_reused() {
        let (pool, created) = counting_pool(2);
        {
            let member = pool.acquire(false).unwrap();
            assert_eq!(*member, 0);
            assert!(pool.is_dirty());
        }
        assert!(!pool.is_dirty());
        assert_eq!(pool.idle(), 1);

        let member = pool.acquire(false).unwrap();
        assert_eq!(*member, 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_non_blocking_acquire_on_exhausted_pool() {
        let (pool, _) = counting_pool(1);
        let _held = pool.acquire(false).unwrap();
        assert_eq!(
            pool.acquire(false).unwrap_err(),
            BrokerError::PoolExhausted { limit: 1 }
        );
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let (pool, _) = counting_pool(1);
        let held = pool.acquire(true).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || *pool.acquire(true).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn test_blocking_acquire_times_out() {
        let pool = Pool::with_timeout("test", 1, Some(Duration::from_millis(20)), || Ok(()));
        let _held = pool.acquire(true).unwrap();
        assert!(matches!(
            pool.acquire(true),
            Err(BrokerError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_unbounded_pool() {
        let (pool, created) = counting_pool(0);
        let members: Vec<_> = (0..5).map(|_| pool.acquire(false).unwrap()).collect();
        assert_eq!(members.len(), 5);
        assert_eq!(created.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_force_close_drops_stale_members() {
        let (pool, created) = counting_pool(1);
        let held = pool.acquire(false).unwrap();
        pool.force_close_all();
        assert!(!pool.is_dirty());

        drop(held);
        assert_eq!(pool.idle(), 0);

        let fresh = pool.acquire(false).unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_factory_failure_releases_slot() {
        let pool: Arc<Pool<()>> =
            Pool::new("test", 1, || Err(BrokerError::Connection("down".to_string())));
        assert!(pool.acquire(false).is_err());
        assert!(!pool.is_dirty());
    }

    #[test]
    fn test_lifecycle_hooks_run_on_checkout_and_release() {
        let pool = Pool::with_lifecycle(
            "test",
            1,
            None,
            || Ok((false, None)),
            |member: &mut (bool, Option<bool>), block| {
                member.0 = true;
                member.1 = Some(block);
                Ok(())
            },
            |member: &mut (bool, Option<bool>)| member.0 = false,
        );

        {
            let member = pool.acquire(true).unwrap();
            assert_eq!(*member, (true, Some(true)));
        }
        assert!(!pool.is_dirty());

        let member = pool.acquire(false).unwrap();
        assert_eq!(*member, (true, Some(false)));
        drop(member);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_failed_prepare_returns_member() {
        let pool = Pool::with_lifecycle(
            "test",
            1,
            None,
            || Ok(0usize),
            |_: &mut usize, _| Err(BrokerError::Connection("down".to_string())),
            |_: &mut usize| {},
        );
        assert!(pool.acquire(false).is_err());
        assert!(!pool.is_dirty());
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_connection_pool_hands_out_lazy_connections() {
        let info = ConnectionInfo::resolve(Some("memory://"), &crate::settings::Settings::new())
            .unwrap();
        let pool = ConnectionPool::connections(info, 2, None);
        let conn = pool.acquire(false).unwrap();
        assert!(!conn.is_connected());
        assert_eq!(conn.transport_name(), "memory");
    }
}
