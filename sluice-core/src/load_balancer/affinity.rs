//! Cookie-based session affinity.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::domain::route::CookieAffinity;

/// Expired bindings are swept once every this many new bindings.
const SWEEP_EVERY: usize = 256;

/// Where a cookie value was last routed, and until when that holds.
#[derive(Debug, Clone, Copy)]
struct Binding {
    endpoint: SocketAddr,
    expires_at: Instant,
}

/// A `Set-Cookie` the data plane must attach to its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    /// Cookie name.
    pub name: String,
    /// Opaque session value.
    pub value: String,
    /// Path attribute.
    pub path: String,
    /// Lifetime of the cookie.
    pub max_age: Duration,
}

impl SetCookie {
    /// Render as a `Set-Cookie` header value.
    pub fn header_value(&self) -> String {
        format!(
            "{}={}; Path={}; Max-Age={}; HttpOnly",
            self.name,
            self.value,
            self.path,
            self.max_age.as_secs()
        )
    }
}

/// Per-route map from cookie value to the endpoint it is pinned to.
///
/// Entries live for the configured cookie lifetime. The map is sharded, so
/// lookups for one session do not contend with bindings for another.
/// Clients that never send their cookie back leave bindings nobody looks up
/// again; those are swept periodically as new sessions are bound.
#[derive(Debug)]
pub struct SessionAffinity {
    cookie: CookieAffinity,
    bindings: DashMap<String, Binding>,
    binds: AtomicUsize,
}

impl SessionAffinity {
    /// Empty affinity state for one route.
    pub fn new(cookie: CookieAffinity) -> Self {
        Self {
            cookie,
            bindings: DashMap::new(),
            binds: AtomicUsize::new(0),
        }
    }

    /// Name of the session cookie.
    pub fn cookie_name(&self) -> &str {
        &self.cookie.name
    }

    /// The endpoint `value` is pinned to, if the binding is unexpired and the
    /// endpoint is still in `live` (sorted).
    ///
    /// Expired or orphaned bindings are dropped and reported as a miss.
    pub fn lookup(&self, value: &str, live: &[SocketAddr], now: Instant) -> Option<SocketAddr> {
        let usable = |binding: &Binding| {
            binding.expires_at > now && live.binary_search(&binding.endpoint).is_ok()
        };

        let binding = self.bindings.get(value).map(|entry| *entry.value())?;
        if usable(&binding) {
            return Some(binding.endpoint);
        }

        self.bindings.remove_if(value, |_, b| !usable(b));
        None
    }

    /// Pin a new session to `endpoint` and return the cookie to issue.
    pub fn bind(&self, endpoint: SocketAddr, now: Instant) -> SetCookie {
        if self.binds.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired(now);
            if purged > 0 {
                debug!(cookie = %self.cookie.name, purged, "expired session bindings swept");
            }
        }

        let value = new_session_value();
        let ttl = self.cookie.ttl();
        self.bindings.insert(
            value.clone(),
            Binding {
                endpoint,
                expires_at: now + ttl,
            },
        );
        SetCookie {
            name: self.cookie.name.clone(),
            value,
            path: self.cookie.path.clone(),
            max_age: ttl,
        }
    }

    /// Drop every expired binding. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, binding| binding.expires_at > now);
        before.saturating_sub(self.bindings.len())
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no session is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn new_session_value() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Find the value of cookie `name` in a `Cookie` request header.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}
