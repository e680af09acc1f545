//! Lock-free hot pool implementation using DashMap and SegQueue.

use std::net::SocketAddr;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;

use crate::client::ControlBody;

/// A lock-free pool of idle control-channel connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    /// Maps an admin endpoint to a lock-free queue of idle HTTP/1.1 senders.
    idle_connections: Arc<DashMap<SocketAddr, Arc<SegQueue<SendRequest<ControlBody>>>>>,
}

impl ConnectionPool {
    /// Creates a new empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops an idle sender to `addr`, skipping closed ones.
    ///
    /// The caller still has to wait for `ready()` before sending.
    pub fn try_pop(&self, addr: &SocketAddr) -> Option<SendRequest<ControlBody>> {
        let queue = self.idle_connections.get(addr)?;
        while let Some(sender) = queue.pop() {
            if !sender.is_closed() {
                return Some(sender);
            }
        }
        None
    }

    /// Returns a sender to the pool for reuse.
    pub fn push(&self, addr: SocketAddr, sender: SendRequest<ControlBody>) {
        if sender.is_closed() {
            return;
        }

        let queue = self
            .idle_connections
            .entry(addr)
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();

        queue.push(sender);
    }

    /// Number of idle senders held for `addr`.
    pub fn idle(&self, addr: &SocketAddr) -> usize {
        self.idle_connections
            .get(addr)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}
