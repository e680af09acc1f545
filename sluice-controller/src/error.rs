//! Error types for the controller.
//!
//! Errors that cross the control channel or the status surface carry an
//! `is_transient` classification: transient I/O is retried and then
//! escalated, rejections are surfaced as-is.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use sluice_admin::{ProtocolError, StatusParseError};
use sluice_core::BackendId;
use thiserror::Error;

/// The configuration file could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The file is not valid TOML for the controller.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// A single HTTP exchange with the data plane failed.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The TCP connection could not be established.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address dialed.
        addr: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The HTTP exchange failed.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    /// No response within the client timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Request(_))
    }
}

/// A dynamic backend update was not applied.
#[derive(Debug, Error)]
pub enum PushError {
    /// Only endpoint-only diffs can be pushed.
    #[error("diff is not endpoint-only")]
    NotEndpointsOnly,

    /// A backend named by the diff has no set in the snapshot.
    #[error("backend {0} is not in the snapshot")]
    MissingBackend(BackendId),

    /// The control channel could not be reached or timed out.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The data plane answered with a non-success status.
    #[error("data plane returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Diagnostic from the ack, if any.
        message: String,
    },

    /// The data plane explicitly refused the update.
    #[error("data plane rejected update: {0}")]
    Rejected(String),

    /// The acknowledgement could not be decoded.
    #[error("unreadable acknowledgement: {0}")]
    Ack(#[from] ProtocolError),

    /// The request body could not be staged.
    #[error("could not stage request body: {0}")]
    Staging(#[source] io::Error),
}

impl PushError {
    /// Whether the same payload may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Client(err) => err.is_transient(),
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// A full reload did not take effect.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The snapshot cannot be rendered into a valid configuration.
    #[error("malformed configuration: {0}")]
    Malformed(String),

    /// JSON serialization failed.
    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Reading or writing the configuration file failed.
    #[error("configuration file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A command could not be started.
    #[error("could not run {command:?}: {source}")]
    Spawn {
        /// Program name.
        command: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The data plane rejected the candidate configuration.
    #[error("configuration test failed ({status}): {stderr}")]
    TestFailed {
        /// Exit status of the test command.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The reload command failed and the previous file was restored.
    #[error("reload command failed ({status}): {stderr}")]
    ReloadFailed {
        /// Exit status of the reload command.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}

impl ReloadError {
    /// Whether the snapshot itself is bad, as opposed to the data plane
    /// refusing or failing to load it.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Serialize(_))
    }
}

/// One poll of the status surface failed.
#[derive(Debug, Error)]
pub enum DrainError {
    /// The status endpoint is not `host:port/path`.
    #[error("invalid status endpoint {0:?}")]
    InvalidEndpoint(String),

    /// The request failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The status endpoint answered with a non-200 status.
    #[error("status endpoint returned HTTP {0}")]
    Status(u16),

    /// The body did not contain the accepted counter.
    #[error(transparent)]
    Parse(#[from] StatusParseError),
}
