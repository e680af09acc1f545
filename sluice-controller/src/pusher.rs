//! Dynamic Update Pusher: delivers endpoint-only changes to the live data
//! plane without a reload.
//!
//! Each push carries the full current set of every affected backend with
//! its generation. Bodies above the configured threshold are staged to a
//! temporary file and streamed from there.

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use prost::encoding::{encode_key, WireType};
use prost::Message;
use sluice_admin::protocol::{BACKENDS_PATH, PROTOBUF_CONTENT_TYPE};
use sluice_admin::{UpdateAck, UpdateBackendsRequest};
use sluice_core::{ConfigurationSnapshot, Diff};
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::client::{ControlBody, ControlClient};
use crate::config::ControlConfig;
use crate::error::PushError;

const STREAM_CHUNK: usize = 8 * 1024;

/// Pusher tuning.
#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// Bound on one request.
    pub timeout: Duration,
    /// Bodies larger than this are staged to a file.
    pub body_buffer_threshold: usize,
    /// Directory for staged bodies.
    pub staging_dir: Option<PathBuf>,
    /// Retries of transient failures.
    pub retries: usize,
    /// First retry delay.
    pub retry_delay: Duration,
}

impl From<&ControlConfig> for PusherConfig {
    fn from(config: &ControlConfig) -> Self {
        Self {
            timeout: config.timeout(),
            body_buffer_threshold: config.body_buffer_threshold,
            staging_dir: config.staging_dir.clone(),
            retries: config.retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// An encoded update, in memory or on disk.
#[derive(Debug)]
enum StagedBody {
    Memory(Bytes),
    File { file: NamedTempFile, len: u64 },
}

impl StagedBody {
    fn len(&self) -> u64 {
        match self {
            Self::Memory(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// A fresh body reading from the start of the payload.
    fn body(&self) -> io::Result<ControlBody> {
        match self {
            Self::Memory(bytes) => Ok(Full::new(bytes.clone())
                .map_err(|never| match never {})
                .boxed()),
            Self::File { file, .. } => {
                let reader = tokio::fs::File::from_std(file.reopen()?);
                Ok(stream_file(reader))
            }
        }
    }
}

/// Stream a file as body frames from a background task.
fn stream_file(mut reader: tokio::fs::File) -> ControlBody {
    let (tx, rx) = mpsc::channel::<io::Result<Frame<Bytes>>>(4);

    tokio::task::spawn(async move {
        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]));
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    StreamBody::new(ReceiverStream::new(rx)).boxed()
}

/// Sends backend-set updates over the control channel.
#[derive(Debug, Clone)]
pub struct DynamicUpdatePusher {
    client: ControlClient,
    config: PusherConfig,
}

impl DynamicUpdatePusher {
    /// A pusher talking to the admin server at `config.endpoint`.
    pub fn new(config: &ControlConfig) -> Self {
        Self::with_client(
            ControlClient::new(config.endpoint, config.timeout()),
            PusherConfig::from(config),
        )
    }

    /// A pusher over an existing client.
    pub fn with_client(client: ControlClient, config: PusherConfig) -> Self {
        Self { client, config }
    }

    /// The underlying control client.
    pub fn client(&self) -> &ControlClient {
        &self.client
    }

    /// Build the update for an endpoint-only diff.
    ///
    /// Every backend the diff names must have a set in `snapshot`; a removed
    /// backend keeps an empty set with a newer generation. A missing one has
    /// no generation the data plane would accept, so it is refused here and
    /// the cycle falls back to a reload.
    pub fn build_request(
        diff: &Diff,
        snapshot: &ConfigurationSnapshot,
    ) -> Result<UpdateBackendsRequest, PushError> {
        let Diff::EndpointsOnly { backends } = diff else {
            return Err(PushError::NotEndpointsOnly);
        };

        let sets = backends
            .iter()
            .map(|id| {
                snapshot
                    .backend(id)
                    .map(|set| (id, set))
                    .ok_or_else(|| PushError::MissingBackend(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UpdateBackendsRequest::from_sets(sets))
    }

    /// Push the backend sets named by an endpoint-only `diff`.
    ///
    /// Succeeds only on an explicit acknowledgement. Transient failures are
    /// retried with backoff; rejections are returned at once.
    pub async fn push(&self, diff: &Diff, snapshot: &ConfigurationSnapshot) -> Result<UpdateAck, PushError> {
        let request = Self::build_request(diff, snapshot)?;
        let staged = self.stage(&request)?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.retry_delay)
            .with_max_times(self.config.retries)
            .with_jitter();
        let max_retries = self.config.retries;
        let mut attempt = 0usize;

        let ack = (|| self.send_once(&staged))
            .retry(backoff)
            .when(PushError::is_transient)
            .notify(|err: &PushError, delay: Duration| {
                attempt += 1;
                warn!(
                    attempt,
                    max_retries,
                    next_delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "control request failed, will retry"
                );
            })
            .await?;

        debug!(backends = request.backends.len(), message = %ack.message, "backend update acknowledged");
        Ok(ack)
    }

    /// Encode `request` in memory, or straight into a temporary file when it
    /// is over the threshold.
    fn stage(&self, request: &UpdateBackendsRequest) -> Result<StagedBody, PushError> {
        let threshold = self.config.body_buffer_threshold;
        let len = request.encoded_len();
        if len <= threshold {
            return Ok(StagedBody::Memory(Bytes::from(request.encode_to_vec())));
        }

        let mut file = match &self.config.staging_dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .map_err(PushError::Staging)?;
        write_entries(request, &mut file).map_err(PushError::Staging)?;

        info!(
            bytes = len,
            threshold,
            path = %file.path().display(),
            "control request body staged to temporary file"
        );
        Ok(StagedBody::File {
            file,
            len: len as u64,
        })
    }

    async fn send_once(&self, staged: &StagedBody) -> Result<UpdateAck, PushError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(BACKENDS_PATH)
            .header(HOST, self.client.addr().to_string())
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .header(CONTENT_LENGTH, staged.len())
            .body(staged.body().map_err(PushError::Staging)?)
            .map_err(crate::error::ClientError::from)?;

        let (status, body) = self.client.send(request).await?;
        let ack = UpdateAck::decode_body(&body);

        if !status.is_success() {
            return Err(PushError::Status {
                status: status.as_u16(),
                message: ack.map(|ack| ack.message).unwrap_or_default(),
            });
        }

        let ack = ack?;
        if !ack.success {
            return Err(PushError::Rejected(ack.message));
        }
        Ok(ack)
    }
}

/// Write the wire form of `request` one entry at a time.
fn write_entries(request: &UpdateBackendsRequest, out: impl Write) -> io::Result<()> {
    let mut out = BufWriter::new(out);
    let mut chunk = Vec::new();
    for entry in &request.backends {
        chunk.clear();
        encode_key(1, WireType::LengthDelimited, &mut chunk);
        entry
            .encode_length_delimited(&mut chunk)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        out.write_all(&chunk)?;
    }
    out.flush()
}
