pub mod connection;
pub mod connection_pool;

pub use connection::ConnectionFactory;
pub use connection_pool::{ConnectionPool, PoolError, PooledConnection};
