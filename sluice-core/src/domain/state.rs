//! Desired-state accumulator that turns change events into snapshots.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use tracing::debug;

use crate::domain::backend::{BackendId, BackendSet};
use crate::domain::event::{ChangeEvent, ChangeKind, Resource};
use crate::domain::route::{Route, RouteKey};
use crate::domain::snapshot::ConfigurationSnapshot;

/// Accumulates change events and produces immutable snapshots.
///
/// Owns the generation counter of every backend. A generation only moves
/// when membership changes, and it is remembered across removal so a
/// backend that comes back never reuses an old number.
#[derive(Debug, Default)]
pub struct DesiredState {
    routes: BTreeMap<RouteKey, Route>,
    backends: BTreeMap<BackendId, BackendSet>,
    generations: HashMap<BackendId, u64>,
}

impl DesiredState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns whether the desired state changed.
    pub fn apply(&mut self, event: ChangeEvent) -> bool {
        match (event.kind, event.resource) {
            (ChangeKind::Removed, Resource::Route(route)) => {
                self.routes.remove(&route.key()).is_some()
            }
            (_, Resource::Route(route)) => {
                let key = route.key();
                if self.routes.get(&key) == Some(&route) {
                    return false;
                }
                self.routes.insert(key, route);
                true
            }
            (ChangeKind::Removed, Resource::Backend { id, .. }) => {
                self.set_endpoints(id, Vec::new())
            }
            (_, Resource::Backend { id, endpoints }) => self.set_endpoints(id, endpoints),
        }
    }

    /// Apply a batch of events. Returns whether anything changed.
    pub fn apply_all(&mut self, events: impl IntoIterator<Item = ChangeEvent>) -> bool {
        events
            .into_iter()
            .fold(false, |changed, event| self.apply(event) || changed)
    }

    fn set_endpoints(&mut self, id: BackendId, endpoints: Vec<SocketAddr>) -> bool {
        let high_water = self.generations.get(&id).copied().unwrap_or(0);
        let candidate = BackendSet::new(high_water, endpoints);

        match self.backends.get(&id) {
            Some(current) if current.same_members(&candidate) => return false,
            None if candidate.is_empty() => return false,
            _ => {}
        }

        let generation = high_water + 1;
        debug!(backend = %id, generation, endpoints = candidate.len(), "backend membership changed");
        self.generations.insert(id.clone(), generation);
        self.backends
            .insert(id, BackendSet::new(generation, candidate.endpoints().iter().copied()));
        true
    }

    /// Current generation of a backend, or 0 if it was never seen.
    pub fn generation(&self, id: &BackendId) -> u64 {
        self.generations.get(id).copied().unwrap_or(0)
    }

    /// Freeze the current state.
    pub fn snapshot(&self) -> ConfigurationSnapshot {
        ConfigurationSnapshot::from_unique(
            self.routes.values().cloned().collect(),
            self.backends.clone(),
        )
    }
}
