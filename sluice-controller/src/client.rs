//! HTTP/1 client for the data plane's admin server.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection_pool::ConnectionPool;
use crate::error::ClientError;

/// Request body used on the control channel.
pub type ControlBody = BoxBody<Bytes, io::Error>;

/// A body with no content.
pub fn empty_body() -> ControlBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Open a fresh HTTP/1 connection to `addr` (`host:port`).
pub async fn connect(addr: &str) -> Result<SendRequest<ControlBody>, ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    let addr = addr.to_string();
    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;

    tokio::task::spawn(async move {
        if let Err(err) = connection.await {
            debug!(%addr, error = %err, "control connection closed with error");
        }
    });
    Ok(sender)
}

/// Send one request on `sender` and read the whole response.
pub async fn exchange(
    sender: &mut SendRequest<ControlBody>,
    request: Request<ControlBody>,
) -> Result<(StatusCode, Bytes), ClientError> {
    sender.ready().await?;
    let response = sender.send_request(request).await?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

/// Pooled client for one admin endpoint.
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: SocketAddr,
    pool: ConnectionPool,
    timeout: Duration,
}

impl ControlClient {
    /// A client for `addr` whose requests are bounded by `timeout`.
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            pool: ConnectionPool::new(),
            timeout,
        }
    }

    /// The admin endpoint.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Idle pooled connections to the endpoint.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle(&self.addr)
    }

    /// Send `request`, reusing an idle connection when one is available.
    pub async fn send(&self, request: Request<ControlBody>) -> Result<(StatusCode, Bytes), ClientError> {
        tokio::time::timeout(self.timeout, self.send_pooled(request))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn send_pooled(&self, request: Request<ControlBody>) -> Result<(StatusCode, Bytes), ClientError> {
        let mut sender = match self.pool.try_pop(&self.addr) {
            Some(sender) => sender,
            None => connect(&self.addr.to_string()).await?,
        };
        let result = exchange(&mut sender, request).await?;
        self.pool.push(self.addr, sender);
        Ok(result)
    }
}
