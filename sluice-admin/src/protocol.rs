//! Control channel wire protocol.
//!
//! Messages are protobuf encoded with `prost`. An update carries the full
//! endpoint list of every affected backend together with its generation, so
//! the data plane can refuse anything older than what it already serves.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use prost::Message;
use sluice_core::{BackendId, BackendSet};
use thiserror::Error;

/// Path of the backend-set update endpoint.
pub const BACKENDS_PATH: &str = "/configuration/backends";

/// Path of the connection status endpoint.
pub const STATUS_PATH: &str = "/nginx_status";

/// Content type of protobuf request and response bodies.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// The full endpoint list of one backend at one generation.
#[derive(Clone, PartialEq, Message)]
pub struct BackendEntry {
    /// Backend identity.
    #[prost(string, tag = "1")]
    pub backend_id: String,
    /// Generation of this endpoint list.
    #[prost(uint64, tag = "2")]
    pub generation: u64,
    /// Endpoints as `ip:port`, sorted.
    #[prost(string, repeated, tag = "3")]
    pub endpoints: Vec<String>,
}

/// Replace the endpoint lists of the listed backends.
#[derive(Clone, PartialEq, Message)]
pub struct UpdateBackendsRequest {
    /// One entry per affected backend.
    #[prost(message, repeated, tag = "1")]
    pub backends: Vec<BackendEntry>,
}

/// The data plane's answer to an update.
#[derive(Clone, PartialEq, Message)]
pub struct UpdateAck {
    /// Whether the update was applied.
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Diagnostic detail, mostly useful on rejection.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// A control message could not be decoded or interpreted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The body is not a valid protobuf message.
    #[error("malformed control message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// An endpoint is not a socket address.
    #[error("backend {backend}: invalid endpoint {endpoint:?}")]
    InvalidEndpoint {
        /// Backend the endpoint belongs to.
        backend: String,
        /// The offending value.
        endpoint: String,
    },

    /// The same backend appears twice in one update.
    #[error("backend {0} listed more than once")]
    DuplicateBackend(String),
}

impl UpdateBackendsRequest {
    /// Build an update from full backend sets.
    pub fn from_sets<'a>(sets: impl IntoIterator<Item = (&'a BackendId, &'a BackendSet)>) -> Self {
        let backends = sets
            .into_iter()
            .map(|(id, set)| BackendEntry {
                backend_id: id.to_string(),
                generation: set.generation(),
                endpoints: set.endpoints().iter().map(ToString::to_string).collect(),
            })
            .collect();
        Self { backends }
    }

    /// Decode a request body.
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::decode(body)?)
    }

    /// Convert back into backend sets.
    pub fn into_sets(self) -> Result<BTreeMap<BackendId, BackendSet>, ProtocolError> {
        let mut sets = BTreeMap::new();
        for entry in self.backends {
            let endpoints = entry
                .endpoints
                .iter()
                .map(|raw| {
                    raw.parse::<SocketAddr>()
                        .map_err(|_| ProtocolError::InvalidEndpoint {
                            backend: entry.backend_id.clone(),
                            endpoint: raw.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let id = BackendId::new(entry.backend_id.clone());
            if sets
                .insert(id, BackendSet::new(entry.generation, endpoints))
                .is_some()
            {
                return Err(ProtocolError::DuplicateBackend(entry.backend_id));
            }
        }
        Ok(sets)
    }
}

impl UpdateAck {
    /// An acknowledgement of success.
    pub fn applied(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// An explicit rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }

    /// Decode a response body.
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self::decode(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_generation_and_sorted_endpoints() {
        let id = BackendId::from("default-echo-80");
        let set = BackendSet::new(
            4,
            ["10.0.0.2:80".parse().unwrap(), "10.0.0.1:80".parse().unwrap()],
        );
        let request = UpdateBackendsRequest::from_sets([(&id, &set)]);

        assert_eq!(request.backends.len(), 1);
        assert_eq!(request.backends[0].generation, 4);
        assert_eq!(request.backends[0].endpoints, vec!["10.0.0.1:80", "10.0.0.2:80"]);

        let decoded = UpdateBackendsRequest::decode_body(&request.encode_to_vec()).unwrap();
        let sets = decoded.into_sets().unwrap();
        assert_eq!(sets[&id], set);
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let request = UpdateBackendsRequest {
            backends: vec![BackendEntry {
                backend_id: "echo".to_string(),
                generation: 1,
                endpoints: vec!["not-an-address".to_string()],
            }],
        };
        assert!(matches!(
            request.into_sets(),
            Err(ProtocolError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_duplicate_backend_is_rejected() {
        let entry = BackendEntry {
            backend_id: "echo".to_string(),
            generation: 1,
            endpoints: Vec::new(),
        };
        let request = UpdateBackendsRequest {
            backends: vec![entry.clone(), entry],
        };
        assert!(matches!(
            request.into_sets(),
            Err(ProtocolError::DuplicateBackend(id)) if id == "echo"
        ));
    }

    #[test]
    fn test_garbage_body_fails_to_decode() {
        assert!(UpdateAck::decode_body(&[0xff, 0xff, 0xff]).is_err());
    }
}
