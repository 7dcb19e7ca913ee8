//! Bounded pool of reusable remote-service connections.
//!
//! The pool partitions connections into an idle list and an in-use id set.
//! Callers get a [`PooledConnection`] guard; dropping it (or passing it to
//! [`ConnectionPool::release`]) gives the connection back, either straight
//! to the oldest waiting acquirer or to the idle list.
//!
//! Live connections (idle + in use + being created) never exceed `max_size`.
//! When the pool is full, acquirers queue FIFO on a oneshot hand-off and give
//! up after `connection_timeout`.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use stratum_types::config::PoolConfig;
use stratum_types::error::{AdapterError, ConfigError, ErrorKind, HasErrorKind};
use stratum_types::status::PoolStats;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionFactory;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out after {timeout:?} waiting for a connection from pool '{pool}'")]
    Timeout { pool: String, timeout: Duration },

    #[error("pool '{0}' is closed")]
    Closed(String),

    #[error("failed to open connection for pool '{pool}'")]
    Connection {
        pool: String,
        #[source]
        source: AdapterError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HasErrorKind for PoolError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Closed(_) => ErrorKind::Connection,
            Self::Connection { source, .. } => source.error_kind(),
            Self::Config(_) => ErrorKind::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Entry<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

/// What a waiting acquirer receives.
enum Handoff<C> {
    /// A released connection, already marked in use.
    Connection(Entry<C>),
    /// A freed slot, already reserved as a pending create.
    Capacity,
}

struct PoolState<C> {
    idle: VecDeque<Entry<C>>,
    in_use: HashSet<u64>,
    /// Slots reserved for connections being created.
    pending: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<C>>>,
    next_id: u64,
    closed: bool,
    total_created: u64,
    total_closed: u64,
    total_acquired: u64,
    acquire_timeouts: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            in_use: HashSet::new(),
            pending: 0,
            waiters: VecDeque::new(),
            next_id: 1,
            closed: false,
            total_created: 0,
            total_closed: 0,
            total_acquired: 0,
            acquire_timeouts: 0,
        }
    }

    fn size(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }

    /// Offer a freed slot to the oldest waiter still listening.
    fn offer_capacity(&mut self) {
        while let Some(tx) = self.waiters.pop_front() {
            self.pending += 1;
            if tx.send(Handoff::Capacity).is_ok() {
                return;
            }
            self.pending -= 1;
        }
    }

    /// Hand `entry` to the oldest live waiter, or park it as idle.
    fn hand_off(&mut self, mut entry: Entry<C>) {
        while let Some(tx) = self.waiters.pop_front() {
            self.in_use.insert(entry.id);
            match tx.send(Handoff::Connection(entry)) {
                Ok(()) => return,
                Err(returned) => {
                    let Handoff::Connection(back) = returned else {
                        return;
                    };
                    self.in_use.remove(&back.id);
                    entry = back;
                }
            }
        }
        self.idle.push_back(entry);
    }

    fn register(&mut self, conn: C) -> Entry<C> {
        let now = Instant::now();
        let id = self.next_id;
        self.next_id += 1;
        self.total_created += 1;
        Entry {
            id,
            conn,
            created_at: now,
            last_used: now,
        }
    }
}

struct Inner<F: ConnectionFactory> {
    name: String,
    config: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Connection>>,
    shutdown: CancellationToken,
}

impl<F: ConnectionFactory> Inner<F> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().expect("connection pool lock poisoned")
    }

    /// Close connections on a background task so `Drop` paths never block.
    fn close_detached(self: &Arc<Self>, conns: Vec<F::Connection>) {
        if conns.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    for conn in conns {
                        inner.factory.close(conn).await;
                    }
                });
            }
            // No runtime left to close on; dropping is all we can do.
            Err(_) => drop(conns),
        }
    }

    fn release(self: &Arc<Self>, mut entry: Entry<F::Connection>, broken: bool) {
        let mut st = self.lock_state();
        if !st.in_use.remove(&entry.id) {
            drop(st);
            tracing::debug!(
                pool = self.name.as_str(),
                connection_id = entry.id,
                "release of unknown connection ignored"
            );
            return;
        }

        let now = Instant::now();
        let expired = now.saturating_duration_since(entry.created_at) >= self.config.max_lifetime();
        let over_capacity = st.size() >= self.config.max_size;
        if st.closed || broken || expired || over_capacity {
            st.total_closed += 1;
            if !st.closed {
                st.offer_capacity();
            }
            drop(st);
            tracing::debug!(
                pool = self.name.as_str(),
                connection_id = entry.id,
                broken,
                expired,
                "closing released connection"
            );
            self.close_detached(vec![entry.conn]);
            return;
        }

        entry.last_used = now;
        st.hand_off(entry);
    }

    /// Give back a reserved create slot.
    fn return_slot(&self) {
        let mut st = self.lock_state();
        st.pending = st.pending.saturating_sub(1);
        if !st.closed {
            st.offer_capacity();
        }
    }
}

impl<F: ConnectionFactory> Drop for Inner<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A reserved create slot. Dropped unfulfilled (create failed or the
/// acquirer was cancelled), it frees the slot for the next waiter.
struct PendingSlot<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    armed: bool,
}

impl<F: ConnectionFactory> PendingSlot<F> {
    fn new(inner: Arc<Inner<F>>) -> Self {
        Self { inner, armed: true }
    }

    /// Register `conn` as in use by the caller.
    fn fulfill(mut self, conn: F::Connection) -> Result<Entry<F::Connection>, PoolError> {
        self.armed = false;
        let mut st = self.inner.lock_state();
        st.pending = st.pending.saturating_sub(1);
        let entry = st.register(conn);
        if st.closed {
            st.total_closed += 1;
            drop(st);
            self.inner.close_detached(vec![entry.conn]);
            return Err(PoolError::Closed(self.inner.name.clone()));
        }
        st.in_use.insert(entry.id);
        Ok(entry)
    }

    /// Register `conn` and hand it to a waiter or the idle list.
    fn park(mut self, conn: F::Connection) -> Result<(), PoolError> {
        self.armed = false;
        let mut st = self.inner.lock_state();
        st.pending = st.pending.saturating_sub(1);
        let entry = st.register(conn);
        if st.closed {
            st.total_closed += 1;
            drop(st);
            self.inner.close_detached(vec![entry.conn]);
            return Err(PoolError::Closed(self.inner.name.clone()));
        }
        st.hand_off(entry);
        Ok(())
    }
}

impl<F: ConnectionFactory> Drop for PendingSlot<F> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.return_slot();
        }
    }
}

/// Queue position of a blocked acquirer. If the acquirer gives up after a
/// hand-off was already sent, the drop puts it back.
struct Waiter<F: ConnectionFactory> {
    rx: oneshot::Receiver<Handoff<F::Connection>>,
    inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Drop for Waiter<F> {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Connection(entry)) => self.inner.release(entry, false),
            Ok(Handoff::Capacity) => self.inner.return_slot(),
            Err(_) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A connection checked out of the pool.
///
/// Derefs to the factory's connection type. Dropping the guard releases it.
pub struct PooledConnection<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
    entry: Option<Entry<F::Connection>>,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(inner: Arc<Inner<F>>, entry: Entry<F::Connection>) -> Self {
        Self {
            inner,
            entry: Some(entry),
            broken: false,
        }
    }

    fn entry(&self) -> &Entry<F::Connection> {
        self.entry
            .as_ref()
            .expect("pooled connection used after release")
    }

    /// Pool-assigned id, unique for the pool's lifetime.
    pub fn id(&self) -> u64 {
        self.entry().id
    }

    pub fn created_at(&self) -> Instant {
        self.entry().created_at
    }

    pub fn last_used(&self) -> Instant {
        self.entry().last_used
    }

    /// Close this connection on release instead of returning it to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.entry().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .entry
            .as_mut()
            .expect("pooled connection used after release")
            .conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.inner.release(entry, self.broken);
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.inner.name)
            .field("id", &self.entry.as_ref().map(|e| e.id))
            .field("broken", &self.broken)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

enum Next<F: ConnectionFactory> {
    Idle(Entry<F::Connection>),
    Create(PendingSlot<F>),
    Wait(Waiter<F>),
}

/// Bounded pool of connections produced by a [`ConnectionFactory`].
///
/// Cloning is cheap and every clone shares the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool. No connections are opened and no background
    /// task is spawned; see [`ConnectionPool::start`].
    pub fn new(name: impl Into<String>, config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                factory,
                state: Mutex::new(PoolState::new()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Create the pool, open `min_size` connections and start maintenance.
    pub async fn start(name: impl Into<String>, config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        let pool = Self::new(name, config, factory)?;
        pool.initialize().await?;
        pool.start_maintenance();
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Open connections until the pool holds `min_size`.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        loop {
            let slot = {
                let mut st = self.inner.lock_state();
                if st.closed {
                    return Err(PoolError::Closed(self.inner.name.clone()));
                }
                if st.size() >= self.inner.config.min_size {
                    return Ok(());
                }
                st.pending += 1;
                PendingSlot::new(Arc::clone(&self.inner))
            };
            self.create(slot).await?.park_ready()?;
        }
    }

    /// Check out a connection, waiting up to `connection_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        let timeout = self.inner.config.connection_timeout();
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(Ok(conn)) => {
                self.inner.lock_state().total_acquired += 1;
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.inner.lock_state().acquire_timeouts += 1;
                tracing::warn!(
                    pool = self.inner.name.as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for connection"
                );
                Err(PoolError::Timeout {
                    pool: self.inner.name.clone(),
                    timeout,
                })
            }
        }
    }

    /// Return a connection. Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    /// Close stale idle connections, then top the pool back up to `min_size`.
    pub async fn run_maintenance(&self) {
        let now = Instant::now();
        let stale: Vec<F::Connection> = {
            let mut st = self.inner.lock_state();
            if st.closed {
                return;
            }
            let max_idle = self.inner.config.max_idle_time();
            let max_lifetime = self.inner.config.max_lifetime();
            let (stale, keep): (Vec<_>, Vec<_>) = st.idle.drain(..).partition(|e| {
                now.saturating_duration_since(e.last_used) >= max_idle
                    || now.saturating_duration_since(e.created_at) >= max_lifetime
            });
            st.idle = keep.into();
            st.total_closed += stale.len() as u64;
            for _ in 0..stale.len() {
                st.offer_capacity();
            }
            stale.into_iter().map(|e| e.conn).collect()
        };

        if !stale.is_empty() {
            tracing::debug!(
                pool = self.inner.name.as_str(),
                closed = stale.len(),
                "closing stale idle connections"
            );
        }
        for conn in stale {
            self.inner.factory.close(conn).await;
        }

        if let Err(e) = self.initialize().await {
            tracing::warn!(
                pool = self.inner.name.as_str(),
                error = %e,
                "failed to top up pool to min_size"
            );
        }
    }

    /// Spawn the periodic maintenance task. It stops on [`close`](Self::close)
    /// or when the last pool handle is dropped.
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let period = self.inner.config.maintenance_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        ConnectionPool { inner }.run_maintenance().await;
                    }
                }
            }
        })
    }

    /// Close idle connections, fail waiting acquirers and stop maintenance.
    ///
    /// Connections still checked out are closed when they are released.
    pub async fn close(&self) {
        let idle: Vec<F::Connection> = {
            let mut st = self.inner.lock_state();
            if st.closed {
                return;
            }
            st.closed = true;
            // Dropping the senders wakes every waiter with `Closed`.
            st.waiters.clear();
            st.total_closed += st.idle.len() as u64;
            st.idle.drain(..).map(|e| e.conn).collect()
        };
        self.inner.shutdown.cancel();

        for conn in idle {
            self.inner.factory.close(conn).await;
        }
        tracing::info!(pool = self.inner.name.as_str(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock_state();
        PoolStats {
            name: self.inner.name.clone(),
            size: st.size(),
            idle: st.idle.len(),
            in_use: st.in_use.len(),
            pending: st.pending,
            waiters: st.waiters.iter().filter(|w| !w.is_closed()).count(),
            max_size: self.inner.config.max_size,
            total_created: st.total_created,
            total_closed: st.total_closed,
            total_acquired: st.total_acquired,
            acquire_timeouts: st.acquire_timeouts,
            closed: st.closed,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn acquire_inner(&self) -> Result<PooledConnection<F>, PoolError> {
        loop {
            let next = {
                let mut st = self.inner.lock_state();
                if st.closed {
                    return Err(PoolError::Closed(self.inner.name.clone()));
                }
                if let Some(entry) = st.idle.pop_back() {
                    st.in_use.insert(entry.id);
                    Next::Idle(entry)
                } else if st.size() < self.inner.config.max_size {
                    st.pending += 1;
                    Next::Create(PendingSlot::new(Arc::clone(&self.inner)))
                } else {
                    let (tx, rx) = oneshot::channel();
                    st.waiters.push_back(tx);
                    Next::Wait(Waiter {
                        rx,
                        inner: Arc::clone(&self.inner),
                    })
                }
            };

            match next {
                Next::Idle(entry) => {
                    let mut conn = PooledConnection::new(Arc::clone(&self.inner), entry);
                    let too_old = conn.created_at().elapsed() >= self.inner.config.max_lifetime();
                    if too_old || !self.inner.factory.is_healthy(&*conn).await {
                        tracing::debug!(
                            pool = self.inner.name.as_str(),
                            connection_id = conn.id(),
                            too_old,
                            "discarding idle connection"
                        );
                        conn.mark_broken();
                        continue;
                    }
                    return Ok(conn);
                }
                Next::Create(slot) => return self.create(slot).await.and_then(Created::into_pooled),
                Next::Wait(mut waiter) => match (&mut waiter.rx).await {
                    Ok(Handoff::Connection(entry)) => {
                        return Ok(PooledConnection::new(Arc::clone(&self.inner), entry));
                    }
                    Ok(Handoff::Capacity) => {
                        let slot = PendingSlot::new(Arc::clone(&self.inner));
                        return self.create(slot).await.and_then(Created::into_pooled);
                    }
                    Err(_) => return Err(PoolError::Closed(self.inner.name.clone())),
                },
            }
        }
    }

    async fn create(&self, slot: PendingSlot<F>) -> Result<Created<F>, PoolError> {
        match self.inner.factory.create().await {
            Ok(conn) => Ok(Created { slot, conn }),
            Err(source) => {
                drop(slot);
                tracing::warn!(
                    pool = self.inner.name.as_str(),
                    error = %source,
                    "failed to open connection"
                );
                Err(PoolError::Connection {
                    pool: self.inner.name.clone(),
                    source,
                })
            }
        }
    }
}

/// A freshly opened connection still holding its reserved slot.
struct Created<F: ConnectionFactory> {
    slot: PendingSlot<F>,
    conn: F::Connection,
}

impl<F: ConnectionFactory> Created<F> {
    fn into_pooled(self) -> Result<PooledConnection<F>, PoolError> {
        let inner = Arc::clone(&self.slot.inner);
        let entry = self.slot.fulfill(self.conn)?;
        Ok(PooledConnection::new(inner, entry))
    }

    fn park_ready(self) -> Result<(), PoolError> {
        self.slot.park(self.conn)
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicU64,
        closed: AtomicU64,
        unhealthy: AtomicBool,
        fail_create: AtomicBool,
    }

    impl ConnectionFactory for Arc<FakeFactory> {
        type Connection = u64;

        async fn create(&self) -> Result<u64, AdapterError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(AdapterError::Connection("refused".to_string()));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn close(&self, _conn: u64) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_healthy(&self, _conn: &u64) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }
    }

    fn config(max_size: usize) -> PoolConfig {
        PoolConfig {
            min_size: 0,
            max_size,
            connection_timeout_ms: 100,
            max_idle_time_ms: 1_000,
            max_lifetime_ms: 60_000,
            maintenance_interval_ms: 500,
        }
    }

    fn pool(max_size: usize) -> (ConnectionPool<Arc<FakeFactory>>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        let pool = ConnectionPool::new("object-storage", config(max_size), Arc::clone(&factory)).unwrap();
        (pool, factory)
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (pool, factory) = pool(2);
        let first = pool.acquire().await.unwrap();
        let value = *first;
        pool.release(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(*second, value);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total_acquired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn third_acquire_times_out_at_max_size() {
        let (pool, _) = pool(2);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        assert_eq!(err.error_kind(), ErrorKind::Timeout);

        let stats = pool.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.acquire_timeouts, 1);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn release_hands_off_to_waiter() {
        let (pool, factory) = pool(1);
        let held = pool.acquire().await.unwrap();
        let held_value = *held;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| *c) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().waiters, 1);

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), held_value);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(pool.stats().size <= 1);
    }

    #[tokio::test]
    async fn unknown_release_is_a_no_op() {
        let (pool, _) = pool(2);
        let conn = pool.acquire().await.unwrap();
        let id = conn.id();
        pool.release(conn);
        let before = pool.stats();

        // Same id a second time, then an id the pool never issued.
        let now = Instant::now();
        for id in [id, 999] {
            pool.inner.release(
                Entry {
                    id,
                    conn: 42,
                    created_at: now,
                    last_used: now,
                },
                false,
            );
        }
        assert_eq!(pool.stats(), before);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn unhealthy_idle_connection_is_replaced() {
        let (pool, factory) = pool(2);
        let first = pool.acquire().await.unwrap();
        let first_value = *first;
        drop(first);

        factory.unhealthy.store(true, Ordering::SeqCst);
        let second = pool.acquire().await.unwrap();
        assert_ne!(*second, first_value);
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn broken_connection_is_closed_on_release() {
        let (pool, _) = pool(2);
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.total_closed, 1);
    }

    #[tokio::test]
    async fn create_failure_frees_the_slot() {
        let (pool, factory) = pool(1);
        factory.fail_create.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Connection { .. }));
        assert_eq!(err.error_kind(), ErrorKind::Connection);
        assert_eq!(pool.stats().size, 0);

        factory.fail_create.store(false, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_closes_stale_and_tops_up() {
        let factory = Arc::new(FakeFactory::default());
        let cfg = PoolConfig {
            min_size: 1,
            ..config(4)
        };
        let pool = ConnectionPool::new("secret-access", cfg, Arc::clone(&factory)).unwrap();
        pool.initialize().await.unwrap();
        assert_eq!(pool.stats().idle, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle, 2);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        pool.run_maintenance().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.total_closed, 2);
        assert_eq!(stats.total_created, 3);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_waiters_and_later_acquires() {
        let (pool, factory) = pool(1);
        let held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| *c) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed(_))));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed(_))));

        // In-use connections are closed as they come back.
        drop(held);
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.total_closed, 1);
        tokio::task::yield_now().await;
        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_min_size_and_runs_maintenance() {
        let factory = Arc::new(FakeFactory::default());
        let cfg = PoolConfig {
            min_size: 2,
            ..config(4)
        };
        let pool = ConnectionPool::start("document-db", cfg, Arc::clone(&factory))
            .await
            .unwrap();
        assert_eq!(pool.stats().idle, 2);

        // Idle timeout is 1s and maintenance runs every 500ms.
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert!(stats.total_closed >= 2);
        pool.close().await;
    }

    #[test]
    fn invalid_config_rejected() {
        let factory = Arc::new(FakeFactory::default());
        let cfg = PoolConfig {
            max_size: 0,
            ..config(1)
        };
        assert!(matches!(
            ConnectionPool::new("bad", cfg, factory),
            Err(PoolError::Config(_))
        ));
    }
}
