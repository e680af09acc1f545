//! Per-route backend selection.
//!
//! A [`RouteBalancer`] is consulted once per request. It owns the route's
//! round-robin cursor, one latency cell per endpoint and, when the route asks
//! for it, the session affinity map. The endpoint arena is replaced wholesale
//! on every backend-set update, so concurrent readers see either the old set
//! or the new one, never a mix.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use rand::Rng;

use crate::domain::backend::BackendSet;
use crate::domain::route::{Algorithm, Route, RouteKey};
use crate::error::SelectError;
use crate::load_balancer::affinity::{SessionAffinity, SetCookie};
use crate::load_balancer::ewma::Ewma;
use crate::load_balancer::round_robin::RoundRobin;

/// One endpoint and its latency cell.
#[derive(Debug, Clone)]
struct EndpointSlot {
    addr: SocketAddr,
    latency: Arc<Ewma>,
}

/// Endpoints of one backend-set generation, in stable order.
#[derive(Debug)]
struct EndpointArena {
    generation: u64,
    slots: Vec<EndpointSlot>,
}

impl EndpointArena {
    /// Build the arena for `set`, carrying latency history over from
    /// `previous` for endpoints that survive.
    fn build(set: &BackendSet, previous: Option<&EndpointArena>, decay: f64) -> Self {
        let slots = set
            .endpoints()
            .iter()
            .map(|addr| {
                let latency = previous
                    .and_then(|arena| arena.slot(addr))
                    .map(|slot| Arc::clone(&slot.latency))
                    .unwrap_or_else(|| Arc::new(Ewma::new(decay)));
                EndpointSlot {
                    addr: *addr,
                    latency,
                }
            })
            .collect();

        Self {
            generation: set.generation(),
            slots,
        }
    }

    fn slot(&self, addr: &SocketAddr) -> Option<&EndpointSlot> {
        self.slots
            .binary_search_by(|slot| slot.addr.cmp(addr))
            .ok()
            .map(|index| &self.slots[index])
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        self.slots.iter().map(|slot| slot.addr).collect()
    }
}

/// The outcome of one selection.
#[derive(Debug, Clone)]
pub struct Selection {
    endpoint: SocketAddr,
    set_cookie: Option<SetCookie>,
    latency: Arc<Ewma>,
}

impl Selection {
    /// The endpoint to forward to.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// The session cookie to attach to the response, if a new binding was made.
    pub fn set_cookie(&self) -> Option<&SetCookie> {
        self.set_cookie.as_ref()
    }

    /// Feed the observed response latency back into the endpoint's average.
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.observe_latency(elapsed.as_micros() as f64 / 1000.0);
    }
}

/// Selection state for one route.
#[derive(Debug)]
pub struct RouteBalancer {
    key: RouteKey,
    algorithm: Algorithm,
    affinity: Option<SessionAffinity>,
    endpoints: ArcSwap<EndpointArena>,
    cursor: RoundRobin,
    decay: f64,
}

impl RouteBalancer {
    /// Build the balancer for `route` over its current backend set.
    pub fn new(route: &Route, set: &BackendSet, decay: f64) -> Self {
        Self {
            key: route.key(),
            algorithm: route.policy.load_balance,
            affinity: route.affinity_cookie().cloned().map(SessionAffinity::new),
            endpoints: ArcSwap::from_pointee(EndpointArena::build(set, None, decay)),
            cursor: RoundRobin::new(),
            decay,
        }
    }

    /// The route this balancer serves.
    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Generation of the backend set currently in use.
    pub fn generation(&self) -> u64 {
        self.endpoints.load().generation
    }

    /// Endpoints currently in use.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.load().addrs()
    }

    /// Whether the route pins sessions with a cookie.
    pub fn has_affinity(&self) -> bool {
        self.affinity.is_some()
    }

    /// Session affinity state, when the route has it.
    pub fn affinity(&self) -> Option<&SessionAffinity> {
        self.affinity.as_ref()
    }

    /// Atomically swap in a new backend set.
    ///
    /// Returns `false` without touching anything if `set` is older than the
    /// generation in use.
    pub fn update(&self, set: &BackendSet) -> bool {
        let current = self.endpoints.load();
        if set.generation() < current.generation {
            return false;
        }

        let next = EndpointArena::build(set, Some(&**current), self.decay);
        let len = next.slots.len();
        self.endpoints.store(Arc::new(next));
        self.cursor.clamp(len);
        true
    }

    /// Choose an endpoint for a request carrying `cookie` (the value of this
    /// route's session cookie, if the client sent one).
    pub fn select(&self, cookie: Option<&str>) -> Result<Selection, SelectError> {
        self.select_at(cookie, Instant::now())
    }

    /// [`select`](Self::select) with an explicit clock.
    pub fn select_at(&self, cookie: Option<&str>, now: Instant) -> Result<Selection, SelectError> {
        let arena = self.endpoints.load();
        if arena.slots.is_empty() {
            return Err(SelectError::NoAvailableBackend {
                route: self.key.clone(),
            });
        }

        if let (Some(affinity), Some(value)) = (&self.affinity, cookie) {
            let live: Vec<SocketAddr> = arena.addrs();
            if let Some(endpoint) = affinity.lookup(value, &live, now) {
                if let Some(slot) = arena.slot(&endpoint) {
                    return Ok(Selection {
                        endpoint,
                        set_cookie: None,
                        latency: Arc::clone(&slot.latency),
                    });
                }
            }
        }

        let index = match self.algorithm {
            Algorithm::RoundRobin => self.cursor.next_index(arena.slots.len()).unwrap_or(0),
            Algorithm::Ewma => pick_lower_latency(&arena.slots),
        };
        let slot = &arena.slots[index];

        let set_cookie = self
            .affinity
            .as_ref()
            .map(|affinity| affinity.bind(slot.addr, now));

        Ok(Selection {
            endpoint: slot.addr,
            set_cookie,
            latency: Arc::clone(&slot.latency),
        })
    }
}

/// Power-of-two-choices: sample two distinct endpoints, keep the cheaper one.
fn pick_lower_latency(slots: &[EndpointSlot]) -> usize {
    let n = slots.len();
    if n == 1 {
        return 0;
    }

    let mut rng = rand::thread_rng();
    let first = rng.gen_range(0..n);
    let mut second = rng.gen_range(0..n - 1);
    if second >= first {
        second += 1;
    }

    if slots[second].latency.calculate_score() < slots[first].latency.calculate_score() {
        second
    } else {
        first
    }
}
