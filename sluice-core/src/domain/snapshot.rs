//! Immutable configuration snapshots.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use crate::domain::backend::{BackendId, BackendSet};
use crate::domain::route::{Route, RouteKey};
use crate::error::SnapshotError;

/// The full desired state at one instant.
///
/// Snapshots are compared structurally and never mutated; each observation of
/// new input produces a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigurationSnapshot {
    routes: Vec<Route>,
    backends: BTreeMap<BackendId, BackendSet>,
}

impl ConfigurationSnapshot {
    /// Build a snapshot, rejecting duplicate route identities.
    pub fn new(
        routes: Vec<Route>,
        backends: BTreeMap<BackendId, BackendSet>,
    ) -> Result<Self, SnapshotError> {
        let mut seen = HashSet::with_capacity(routes.len());
        for route in &routes {
            let key = route.key();
            if !seen.insert(key.clone()) {
                return Err(SnapshotError::DuplicateRoute(key));
            }
        }
        Ok(Self { routes, backends })
    }

    /// Callers guarantee route identities are unique.
    pub(crate) fn from_unique(
        routes: Vec<Route>,
        backends: BTreeMap<BackendId, BackendSet>,
    ) -> Self {
        Self { routes, backends }
    }

    /// Routes in snapshot order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// All backend sets keyed by backend.
    pub fn backends(&self) -> &BTreeMap<BackendId, BackendSet> {
        &self.backends
    }

    /// The set for one backend, if present.
    pub fn backend(&self, id: &BackendId) -> Option<&BackendSet> {
        self.backends.get(id)
    }

    /// The route with the given identity.
    pub fn route(&self, key: &RouteKey) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.host == key.host && r.path == key.path)
    }

    /// Backends referenced by at least one route.
    pub fn referenced_backends(&self) -> BTreeSet<&BackendId> {
        self.routes.iter().map(|r| &r.backend).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_route_identity_is_rejected() {
        let routes = vec![
            Route::new("foo.com", "/", BackendId::from("a")),
            Route::new("foo.com", "/", BackendId::from("b")),
        ];
        let err = ConfigurationSnapshot::new(routes, BTreeMap::new()).unwrap_err();
        assert_eq!(err, SnapshotError::DuplicateRoute(RouteKey::new("foo.com", "/")));
    }

    #[test]
    fn test_snapshots_compare_structurally() {
        let build = || {
            let mut backends = BTreeMap::new();
            backends.insert(
                BackendId::from("a"),
                BackendSet::new(1, ["10.0.0.1:80".parse().unwrap()]),
            );
            ConfigurationSnapshot::new(
                vec![Route::new("foo.com", "/", BackendId::from("a"))],
                backends,
            )
            .unwrap()
        };
        assert_eq!(build(), build());
        assert_eq!(build().referenced_backends().len(), 1);
    }
}
