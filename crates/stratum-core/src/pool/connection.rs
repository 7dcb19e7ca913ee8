//! ConnectionFactory trait definition.
//!
//! The pool never knows what a connection is. Adapters (secret manager
//! clients, object storage sessions, document DB handles) implement this
//! trait and the pool calls it to open, probe and close handles.

use std::future::Future;

use stratum_types::error::AdapterError;

/// Opens, probes and closes connections for a [`ConnectionPool`](super::ConnectionPool).
///
/// Uses RPITIT like the rest of the crate's async traits. `close` and
/// `is_healthy` have defaults for handles that need no teardown or probing.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    fn create(&self) -> impl Future<Output = Result<Self::Connection, AdapterError>> + Send;

    /// Tear a connection down. The default just drops it.
    fn close(&self, conn: Self::Connection) -> impl Future<Output = ()> + Send {
        async move { drop(conn) }
    }

    /// Probe an idle connection before handing it out.
    fn is_healthy(&self, _conn: &Self::Connection) -> impl Future<Output = bool> + Send {
        async { true }
    }
}
