//! Routing module for the live view of routes and backend sets.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::domain::backend::{BackendId, BackendSet};
use crate::domain::route::{RouteKey, RouteKind};
use crate::domain::snapshot::ConfigurationSnapshot;
use crate::error::{ApplyError, SelectError};
use crate::load_balancer::affinity::find_cookie;
use crate::load_balancer::selector::{RouteBalancer, Selection};

/// Immutable route index swapped in on full reloads.
#[derive(Debug, Default)]
struct RouteMap {
    by_key: HashMap<RouteKey, Arc<RouteBalancer>>,
    /// Rule routes per host, longest path first.
    by_host: HashMap<String, Vec<Arc<RouteBalancer>>>,
    by_backend: HashMap<BackendId, Vec<Arc<RouteBalancer>>>,
    default_route: Option<Arc<RouteBalancer>>,
}

/// What an accepted backend-set update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Backends whose set was swapped.
    pub applied: Vec<BackendId>,
    /// Backends offered at the generation already in use.
    pub unchanged: Vec<BackendId>,
}

/// A lock-free routing table mapping traffic to backends.
///
/// Uses `ArcSwap` so request handling never takes a lock on the hot path.
/// Full reloads replace the route index; dynamic updates replace backend
/// sets. Writers are serialized among themselves.
#[derive(Debug)]
pub struct RoutingTable {
    routes: ArcSwap<RouteMap>,
    backends: ArcSwap<BTreeMap<BackendId, BackendSet>>,
    writer: Mutex<()>,
    decay: f64,
}

impl RoutingTable {
    /// An empty table whose latency cells use `decay`.
    pub fn new(decay: f64) -> Self {
        Self {
            routes: ArcSwap::from_pointee(RouteMap::default()),
            backends: ArcSwap::from_pointee(BTreeMap::new()),
            writer: Mutex::new(()),
            decay,
        }
    }

    /// Decay factor of this table's latency cells.
    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// A table serving `snapshot`.
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot, decay: f64) -> Self {
        let table = Self::new(decay);
        table.load_snapshot(snapshot);
        table
    }

    /// Replace routes and backend sets wholesale, as a full reload does.
    ///
    /// Per-route selection state starts fresh.
    pub fn load_snapshot(&self, snapshot: &ConfigurationSnapshot) {
        let _writer = self.writer.lock();
        let mut map = RouteMap::default();

        for route in snapshot.routes() {
            let set = snapshot
                .backend(&route.backend)
                .cloned()
                .unwrap_or_else(|| BackendSet::empty(0));
            let balancer = Arc::new(RouteBalancer::new(route, &set, self.decay));

            map.by_key.insert(route.key(), Arc::clone(&balancer));
            map.by_backend
                .entry(route.backend.clone())
                .or_default()
                .push(Arc::clone(&balancer));
            match route.kind {
                RouteKind::DefaultBackend => map.default_route = Some(balancer),
                RouteKind::Rule => map
                    .by_host
                    .entry(route.host.clone())
                    .or_default()
                    .push(balancer),
            }
        }

        for routes in map.by_host.values_mut() {
            routes.sort_by(|a, b| b.key().path.len().cmp(&a.key().path.len()));
        }

        info!(
            routes = map.by_key.len(),
            backends = snapshot.backends().len(),
            "routing table loaded"
        );
        self.routes.store(Arc::new(map));
        self.backends.store(Arc::new(snapshot.backends().clone()));
    }

    /// Apply full backend sets keyed by backend, all-or-nothing.
    ///
    /// Every entry is checked before anything is swapped: an older
    /// generation is stale, and the same generation with different members
    /// is a conflict. Either rejects the whole update. The same generation
    /// with the same members is accepted as a no-op.
    pub fn apply_backends(
        &self,
        update: &BTreeMap<BackendId, BackendSet>,
    ) -> Result<ApplyReport, ApplyError> {
        let _writer = self.writer.lock();
        let current = self.backends.load();
        let mut report = ApplyReport::default();

        for (id, offered) in update {
            if let Some(existing) = current.get(id) {
                if offered.generation() < existing.generation() {
                    return Err(ApplyError::Stale {
                        backend: id.clone(),
                        current: existing.generation(),
                        offered: offered.generation(),
                    });
                }
                if offered.generation() == existing.generation() {
                    if existing.same_members(offered) {
                        report.unchanged.push(id.clone());
                        continue;
                    }
                    return Err(ApplyError::GenerationConflict {
                        backend: id.clone(),
                        generation: offered.generation(),
                    });
                }
            }
            report.applied.push(id.clone());
        }

        if report.applied.is_empty() {
            return Ok(report);
        }

        let routes = self.routes.load();
        let mut next = (**current).clone();
        for id in &report.applied {
            let set = &update[id];
            for balancer in routes.by_backend.get(id).into_iter().flatten() {
                balancer.update(set);
            }
            debug!(
                backend = %id,
                generation = set.generation(),
                endpoints = set.len(),
                "backend set swapped"
            );
            next.insert(id.clone(), set.clone());
        }
        self.backends.store(Arc::new(next));

        Ok(report)
    }

    /// The backend set currently applied for `id`.
    pub fn backend(&self, id: &BackendId) -> Option<BackendSet> {
        self.backends.load().get(id).cloned()
    }

    /// The balancer for an exact route identity.
    pub fn route(&self, key: &RouteKey) -> Option<Arc<RouteBalancer>> {
        self.routes.load().by_key.get(key).cloned()
    }

    /// Match a request: exact host, longest path prefix, then the default
    /// backend.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<RouteBalancer>> {
        let routes = self.routes.load();
        routes
            .by_host
            .get(host)
            .and_then(|candidates| {
                candidates
                    .iter()
                    .find(|balancer| path.starts_with(balancer.key().path.as_str()))
            })
            .or(routes.default_route.as_ref())
            .cloned()
    }

    /// Route a request and pick its endpoint.
    ///
    /// `cookie_header` is the raw `Cookie` header, if any.
    pub fn select(
        &self,
        host: &str,
        path: &str,
        cookie_header: Option<&str>,
    ) -> Result<Selection, SelectError> {
        let balancer = self.lookup(host, path).ok_or_else(|| SelectError::NoRoute {
            host: host.to_string(),
            path: path.to_string(),
        })?;

        let cookie = match (balancer.affinity(), cookie_header) {
            (Some(affinity), Some(header)) => find_cookie(header, affinity.cookie_name()),
            _ => None,
        };
        balancer.select(cookie)
    }
}

/// A shared reference to the lock-free routing table.
pub type SharedRoutingTable = Arc<RoutingTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::route::{Affinity, CookieAffinity, Route, RoutePolicy};
    use std::net::SocketAddr;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 8080))
    }

    fn echo() -> BackendId {
        BackendId::from("echo")
    }

    fn table() -> RoutingTable {
        let sticky = RoutePolicy {
            affinity: Affinity::Cookie(CookieAffinity::new("STICKYSESSION")),
            ..RoutePolicy::default()
        };
        let routes = vec![
            Route::new("foo.com", "/", echo()),
            Route::new("foo.com", "/api", echo()).with_policy(sticky),
            Route::default_backend(BackendId::from("fallback")),
        ];
        let mut backends = BTreeMap::new();
        backends.insert(echo(), BackendSet::new(1, [addr(1), addr(2)]));
        backends.insert(BackendId::from("fallback"), BackendSet::new(1, [addr(9)]));
        RoutingTable::from_snapshot(&ConfigurationSnapshot::new(routes, backends).unwrap(), 0.5)
    }

    fn update(id: BackendId, set: BackendSet) -> BTreeMap<BackendId, BackendSet> {
        BTreeMap::from([(id, set)])
    }

    #[test]
    fn test_lookup_prefers_longest_path_then_default() {
        let table = table();
        assert_eq!(
            table.lookup("foo.com", "/api/users").unwrap().key(),
            &RouteKey::new("foo.com", "/api")
        );
        assert_eq!(
            table.lookup("foo.com", "/index.html").unwrap().key(),
            &RouteKey::new("foo.com", "/")
        );
        assert!(!table.lookup("bar.com", "/").unwrap().has_affinity());
        assert_eq!(table.select("bar.com", "/", None).unwrap().endpoint(), addr(9));
    }

    #[test]
    fn test_apply_swaps_every_route_on_the_backend() {
        let table = table();
        let report = table
            .apply_backends(&update(echo(), BackendSet::new(2, [addr(3)])))
            .unwrap();
        assert_eq!(report.applied, vec![echo()]);

        for path in ["/", "/api"] {
            let route = table.route(&RouteKey::new("foo.com", path)).unwrap();
            assert_eq!(route.endpoints(), vec![addr(3)]);
            assert_eq!(route.generation(), 2);
        }
        assert_eq!(table.backend(&echo()).unwrap().generation(), 2);
    }

    #[test]
    fn test_stale_generation_is_rejected_whole() {
        let table = table();
        let mut batch = update(echo(), BackendSet::new(0, [addr(3)]));
        batch.insert(BackendId::from("fallback"), BackendSet::new(2, [addr(8)]));

        let err = table.apply_backends(&batch).unwrap_err();
        assert_eq!(
            err,
            ApplyError::Stale {
                backend: echo(),
                current: 1,
                offered: 0
            }
        );
        // Nothing from the batch was applied.
        assert_eq!(table.backend(&BackendId::from("fallback")).unwrap().generation(), 1);
    }

    #[test]
    fn test_same_generation_is_idempotent_or_conflict() {
        let table = table();
        let same = table
            .apply_backends(&update(echo(), BackendSet::new(1, [addr(2), addr(1)])))
            .unwrap();
        assert_eq!(same.unchanged, vec![echo()]);
        assert!(same.applied.is_empty());

        let err = table
            .apply_backends(&update(echo(), BackendSet::new(1, [addr(7)])))
            .unwrap_err();
        assert!(matches!(err, ApplyError::GenerationConflict { generation: 1, .. }));
    }

    #[test]
    fn test_select_reads_session_cookie_from_header() {
        let table = table();
        let first = table.select("foo.com", "/api", None).unwrap();
        let cookie = first.set_cookie().unwrap().clone();

        let header = format!("theme=dark; STICKYSESSION={}", cookie.value);
        for _ in 0..3 {
            let again = table.select("foo.com", "/api", Some(&header)).unwrap();
            assert_eq!(again.endpoint(), first.endpoint());
        }
    }

    #[test]
    fn test_unknown_host_without_default_has_no_route() {
        let table = RoutingTable::new(0.5);
        assert!(matches!(
            table.select("foo.com", "/", None),
            Err(SelectError::NoRoute { .. })
        ));
    }
}
