//! Host/path routes and the policy attached to them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::backend::BackendId;

/// Host used by the catch-all default backend route.
pub const DEFAULT_HOST: &str = "_";

/// Identity of a route within a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    /// Virtual host the route matches.
    pub host: String,
    /// Path prefix the route matches.
    pub path: String,
}

impl RouteKey {
    /// Create a route identity.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

/// Load-balancing algorithm applied when no affinity binding decides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Cycle through endpoints in stable order.
    #[default]
    RoundRobin,
    /// Prefer the endpoint with the lowest moving-average latency.
    Ewma,
}

/// Cookie-based session affinity settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CookieAffinity {
    /// Name of the session cookie.
    pub name: String,
    /// Lifetime of a binding, in seconds.
    #[serde(default = "default_cookie_ttl_secs")]
    pub ttl_secs: u64,
    /// Path attribute sent with the cookie.
    #[serde(default = "default_cookie_path")]
    pub path: String,
}

fn default_cookie_ttl_secs() -> u64 {
    172_800
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl CookieAffinity {
    /// Affinity with the given cookie name and default lifetime.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_secs: default_cookie_ttl_secs(),
            path: default_cookie_path(),
        }
    }

    /// Binding lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Session affinity mode for a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// No stickiness.
    #[default]
    None,
    /// Pin clients to an endpoint through a cookie.
    Cookie(CookieAffinity),
}

/// Request buffering limits passed through to the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Buffering {
    /// Largest request body held in memory before spilling to disk.
    pub client_body_buffer_size: u64,
    /// Whether upstream responses are buffered.
    pub proxy_buffering: bool,
}

impl Default for Buffering {
    fn default() -> Self {
        Self {
            client_body_buffer_size: 16 * 1024,
            proxy_buffering: false,
        }
    }
}

/// Certificate binding for a TLS-terminated host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsBinding {
    /// Name of the secret holding the certificate and key.
    pub secret: String,
}

/// Route-level policy. Any change here is structural.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePolicy {
    /// Fallback selection algorithm.
    pub load_balance: Algorithm,
    /// Session affinity mode.
    pub affinity: Affinity,
    /// Buffering limits.
    pub buffering: Buffering,
    /// TLS binding, if the host is served over TLS.
    pub tls: Option<TlsBinding>,
}

/// Whether a route came from explicit rules or is the catch-all backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// Explicit host and path rule.
    #[default]
    Rule,
    /// Default backend with no rules.
    DefaultBackend,
}

/// A host/path rule forwarding to one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Virtual host.
    pub host: String,
    /// Path prefix.
    pub path: String,
    /// Backend the route forwards to.
    pub backend: BackendId,
    /// Rule or default backend.
    #[serde(default)]
    pub kind: RouteKind,
    /// Route-level policy.
    #[serde(default)]
    pub policy: RoutePolicy,
}

impl Route {
    /// A rule route with default policy.
    pub fn new(host: impl Into<String>, path: impl Into<String>, backend: BackendId) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            backend,
            kind: RouteKind::Rule,
            policy: RoutePolicy::default(),
        }
    }

    /// The catch-all route used when no rule matches.
    pub fn default_backend(backend: BackendId) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            path: "/".to_string(),
            backend,
            kind: RouteKind::DefaultBackend,
            policy: RoutePolicy::default(),
        }
    }

    /// Replace the policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RoutePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The `(host, path)` identity.
    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.host.clone(), self.path.clone())
    }

    /// Whether the route has explicit host/path rules.
    pub fn has_rules(&self) -> bool {
        self.kind == RouteKind::Rule
    }

    /// The cookie affinity in effect for this route.
    ///
    /// A default backend without rules never gets affinity, even when the
    /// policy asks for it.
    pub fn affinity_cookie(&self) -> Option<&CookieAffinity> {
        match (&self.policy.affinity, self.has_rules()) {
            (Affinity::Cookie(cookie), true) => Some(cookie),
            _ => None,
        }
    }
}
