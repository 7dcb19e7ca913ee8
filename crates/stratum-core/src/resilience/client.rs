//! ResilientClient -- pooled, breaker-guarded adapter calls.
//!
//! Adapters for remote services reach their dependency through this wrapper:
//! acquire a connection, run the call inside the dependency's circuit
//! breaker, release the connection. Pool and breaker failures surface to the
//! caller immediately.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use stratum_types::error::{AdapterError, ErrorKind, HasErrorKind};

use super::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("circuit '{name}' is open; retry after {retry_at}")]
    CircuitOpen {
        name: String,
        retry_at: DateTime<Utc>,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl From<CircuitError<AdapterError>> for ClientError {
    fn from(err: CircuitError<AdapterError>) -> Self {
        match err {
            CircuitError::Open { name, retry_at, .. } => Self::CircuitOpen { name, retry_at },
            CircuitError::Inner(e) => Self::Adapter(e),
        }
    }
}

impl HasErrorKind for ClientError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Pool(e) => e.error_kind(),
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Adapter(e) => e.error_kind(),
        }
    }
}

/// A connection pool paired with the circuit breaker of the same dependency.
pub struct ResilientClient<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    breaker: Arc<CircuitBreaker>,
}

impl<F: ConnectionFactory> Clone for ResilientClient<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            breaker: Arc::clone(&self.breaker),
        }
    }
}

impl<F: ConnectionFactory> ResilientClient<F> {
    pub fn new(pool: ConnectionPool<F>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { pool, breaker }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `f` against a pooled connection through the breaker.
    ///
    /// The breaker admits the call before a connection is acquired, so an
    /// open circuit never opens or waits for a connection. Pool failures are
    /// not recorded against the breaker. A `Connection`-kind failure marks
    /// the connection broken so it is closed instead of going back to the
    /// idle list.
    pub async fn call<T, Op>(&self, op: Op) -> Result<T, ClientError>
    where
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T, AdapterError>>,
    {
        let permit = self.breaker.try_admit::<AdapterError>()?;
        let mut conn = self.pool.acquire().await?;
        let result = op(&mut *conn).await;
        permit.record(&result);

        if let Err(e) = &result {
            if e.error_kind() == ErrorKind::Connection {
                conn.mark_broken();
            }
        }
        self.pool.release(conn);
        Ok(result?)
    }
}
