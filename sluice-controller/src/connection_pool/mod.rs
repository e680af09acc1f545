//! Idle connection reuse for the control channel.

mod pool;

pub use pool::ConnectionPool;
