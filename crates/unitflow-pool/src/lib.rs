//! Connection pooling for unitflow using asupersync.
//!
//! A [`Pool`] opens connections through a [`ConnectionFactory`] up to `max_connections` and leases
//! them as [`PooledConnection`]s. A lease implements [`Connection`] itself, so a session can be
//! opened directly on it; dropping the lease (closing the session) returns the connection to the
//! idle list.

use asupersync::{Cx, Outcome};
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use unitflow_core::{
    ConfigError, Connection, Dialect, Error, PoolError, PoolErrorKind, Result, RowCursor, Value,
};

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of connections open at once (leased plus idle)
    pub max_connections: usize,
    /// Connections opened by [`Pool::warm_up`]
    pub min_connections: usize,
    /// Ping idle connections before leasing them
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    /// Set minimum connections.
    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Parse a configuration from JSON; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid pool configuration: {}", e),
                source: Some(Box::new(e)),
            })
        })
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(pool_error(PoolErrorKind::Config, "max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(pool_error(
                PoolErrorKind::Config,
                format!(
                    "min_connections ({}) exceeds max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        Ok(())
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

/// Opens new database connections for a pool.
pub trait ConnectionFactory: Send + Sync {
    type Connection: Connection + 'static;

    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of leased connections
    pub active_connections: usize,
    /// Connections opened over the pool's lifetime
    pub created: u64,
    /// Successful leases over the pool's lifetime
    pub acquired: u64,
}

#[derive(Debug)]
struct PoolState<C> {
    idle: VecDeque<Arc<C>>,
    total: usize,
    closed: bool,
    created: u64,
    acquired: u64,
}

type SharedState<C> = Arc<Mutex<PoolState<C>>>;

fn lock<C>(state: &Mutex<PoolState<C>>) -> MutexGuard<'_, PoolState<C>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bounded pool of connections.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: SharedState<F::Connection>,
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool; no connection is opened until the first lease or [`Pool::warm_up`].
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            state: Arc::new(Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
                created: 0,
                acquired: 0,
            })),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            created: state.created,
            acquired: state.acquired,
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        lock(&self.state).total >= self.config.max_connections
    }

    /// Open connections until `min_connections` exist.
    pub async fn warm_up(&self, cx: &Cx) -> Outcome<(), Error> {
        loop {
            {
                let mut state = lock(&self.state);
                if state.closed || state.total >= self.config.min_connections {
                    return Outcome::Ok(());
                }
                state.total += 1;
            }
            let conn = match self.open(cx).await {
                Outcome::Ok(conn) => conn,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            lock(&self.state).idle.push_back(Arc::new(conn));
        }
    }

    /// Lease a connection: an idle one if available, otherwise a new one while below capacity.
    ///
    /// Fails with [`PoolErrorKind::Exhausted`] when every connection is leased.
    #[tracing::instrument(level = "trace", skip(self, cx))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<F::Connection>, Error> {
        loop {
            let idle = {
                let mut state = lock(&self.state);
                if state.closed {
                    return Outcome::Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
                }
                match state.idle.pop_front() {
                    Some(conn) => Some(conn),
                    None if state.total < self.config.max_connections => {
                        state.total += 1;
                        None
                    }
                    None => {
                        return Outcome::Err(pool_error(
                            PoolErrorKind::Exhausted,
                            format!("all {} connections are in use", self.config.max_connections),
                        ));
                    }
                }
            };

            let conn = match idle {
                Some(conn) => {
                    if self.config.test_on_checkout {
                        match conn.ping(cx).await {
                            Outcome::Ok(()) => {}
                            Outcome::Err(e) => {
                                tracing::warn!(error = %e, "Discarding broken pooled connection");
                                lock(&self.state).total -= 1;
                                continue;
                            }
                            Outcome::Cancelled(r) => {
                                lock(&self.state).idle.push_back(conn);
                                return Outcome::Cancelled(r);
                            }
                            Outcome::Panicked(p) => {
                                lock(&self.state).total -= 1;
                                return Outcome::Panicked(p);
                            }
                        }
                    }
                    conn
                }
                None => match self.open(cx).await {
                    Outcome::Ok(conn) => Arc::new(conn),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                },
            };
            lock(&self.state).acquired += 1;
            return Outcome::Ok(PooledConnection {
                conn,
                state: Arc::clone(&self.state),
                discard: false,
            });
        }
    }

    /// Open one connection for a slot already counted in `total`.
    async fn open(&self, cx: &Cx) -> Outcome<F::Connection, Error> {
        match self.factory.connect(cx).await {
            Outcome::Ok(conn) => {
                let mut state = lock(&self.state);
                state.created += 1;
                tracing::debug!(total = state.total, "Opened pooled connection");
                Outcome::Ok(conn)
            }
            other => {
                lock(&self.state).total -= 1;
                other
            }
        }
    }

    /// Close the pool: idle connections are dropped now, leased ones when they come back.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        let idle = state.idle.len();
        state.idle.clear();
        state.total -= idle;
        tracing::debug!(dropped = idle, "Pool closed");
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// A connection leased from a [`Pool`]; returned to the pool on drop.
pub struct PooledConnection<C> {
    conn: Arc<C>,
    state: SharedState<C>,
    discard: bool,
}

impl<C> PooledConnection<C> {
    /// Drop the connection instead of returning it (for example after a protocol error).
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if self.discard || state.closed {
            state.total -= 1;
            tracing::trace!("Pooled connection dropped");
        } else {
            state.idle.push_back(Arc::clone(&self.conn));
            tracing::trace!(idle = state.idle.len(), "Pooled connection returned");
        }
    }
}

impl<C: Connection> Connection for PooledConnection<C> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.conn.execute(cx, sql, params)
    }

    fn execute_batch(
        &self,
        cx: &Cx,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        self.conn.execute_batch(cx, sql, param_sets)
    }

    fn select(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<RowCursor, Error>> + Send {
        self.conn.select(cx, sql, params)
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        self.conn.insert(cx, sql, params)
    }

    fn execute_unprepared(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.conn.execute_unprepared(cx, sql)
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.conn.ping(cx)
    }
}
