//! Admin server for the data plane side of the control channel.
//!
//! Accepts backend-set updates and applies them to the live
//! [`RoutingTable`](sluice_core::RoutingTable), and serves the connection
//! status surface.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prost::Message;
use sluice_core::SharedRoutingTable;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::protocol::{UpdateAck, UpdateBackendsRequest, BACKENDS_PATH, PROTOBUF_CONTENT_TYPE, STATUS_PATH};
use crate::status::ConnectionCounters;

/// State shared by every admin connection.
#[derive(Debug)]
pub struct AdminState {
    table: SharedRoutingTable,
    counters: ConnectionCounters,
}

impl AdminState {
    /// Serve `table` with fresh connection counters.
    pub fn new(table: SharedRoutingTable) -> Self {
        Self {
            table,
            counters: ConnectionCounters::new(),
        }
    }

    /// The routing table updates are applied to.
    pub fn table(&self) -> &SharedRoutingTable {
        &self.table
    }

    /// Connection counters reported on the status surface.
    pub fn counters(&self) -> &ConnectionCounters {
        &self.counters
    }
}

/// A bound admin listener.
#[derive(Debug)]
pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
}

impl AdminServer {
    /// Bind the admin listener on `addr`.
    pub async fn bind(addr: SocketAddr, state: Arc<AdminState>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "admin server listening");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::task::spawn(async move {
                let _connection = state.counters.accept();
                let service = service_fn(|req| handle_request(req, Arc::clone(&state)));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, error = %err, "admin connection closed with error");
                }
            });
        }
    }
}

/// Route an admin request.
async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let _request = state.counters.request();

    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, BACKENDS_PATH) => update_backends(req, &state).await,
        (&Method::GET, STATUS_PATH) => {
            text(StatusCode::OK, state.counters.report().to_string())
        }
        _ => text(StatusCode::NOT_FOUND, "not found\n".to_string()),
    };
    Ok(response)
}

async fn update_backends(req: Request<Incoming>, state: &AdminState) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!(error = %err, "could not read backend update body");
            return ack(StatusCode::BAD_REQUEST, UpdateAck::rejected(err.to_string()));
        }
    };

    let sets = match UpdateBackendsRequest::decode_body(&body).and_then(UpdateBackendsRequest::into_sets) {
        Ok(sets) => sets,
        Err(err) => {
            warn!(error = %err, "rejecting malformed backend update");
            return ack(StatusCode::BAD_REQUEST, UpdateAck::rejected(err.to_string()));
        }
    };

    match state.table.apply_backends(&sets) {
        Ok(report) => {
            info!(
                applied = report.applied.len(),
                unchanged = report.unchanged.len(),
                "backend update applied"
            );
            let message = format!(
                "applied {} backend(s), {} unchanged",
                report.applied.len(),
                report.unchanged.len()
            );
            ack(StatusCode::OK, UpdateAck::applied(message))
        }
        Err(err) => {
            warn!(error = %err, "backend update rejected");
            ack(StatusCode::CONFLICT, UpdateAck::rejected(err.to_string()))
        }
    }
}

fn ack(status: StatusCode, ack: UpdateAck) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(ack.encode_to_vec())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));
    response
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
