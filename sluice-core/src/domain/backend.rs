//! Backend identity and versioned endpoint sets.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// A unique identifier for a backend service, e.g. `default-echo-80`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub String);

impl BackendId {
    /// Create a backend identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The healthy endpoints currently serving one [`BackendId`].
///
/// Endpoints are stored sorted and de-duplicated, which gives round-robin a
/// stable order and makes membership comparison a plain slice comparison.
/// The generation is bumped by the producer every time membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSet {
    generation: u64,
    endpoints: Vec<SocketAddr>,
}

impl BackendSet {
    /// Create a set at the given generation.
    pub fn new(generation: u64, endpoints: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut endpoints: Vec<SocketAddr> = endpoints.into_iter().collect();
        endpoints.sort_unstable();
        endpoints.dedup();
        Self {
            generation,
            endpoints,
        }
    }

    /// Create a set with no endpoints.
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            endpoints: Vec::new(),
        }
    }

    /// The membership version of this set.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The endpoints in stable (sorted) order.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether every endpoint has been removed.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Whether `addr` is a member of this set.
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.endpoints.binary_search(addr).is_ok()
    }

    /// Whether both sets hold exactly the same endpoints, ignoring generation.
    pub fn same_members(&self, other: &BackendSet) -> bool {
        self.endpoints == other.endpoints
    }
}
