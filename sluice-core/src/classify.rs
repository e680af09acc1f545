//! Change classification between two configuration snapshots.
//!
//! The classifier decides whether moving from one snapshot to the next can be
//! done by pushing new backend sets into the running data plane, or whether
//! the whole configuration has to be reloaded. Dynamic updates are
//! all-or-nothing: one structural difference anywhere makes the entire diff
//! structural.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::domain::backend::BackendId;
use crate::domain::route::{Route, RouteKey};
use crate::domain::snapshot::ConfigurationSnapshot;

/// One structural difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralChange {
    /// A route appeared.
    RouteAdded(RouteKey),
    /// A route disappeared.
    RouteRemoved(RouteKey),
    /// A route now forwards to a different backend.
    BackendChanged {
        /// The route.
        route: RouteKey,
        /// Previous backend.
        from: BackendId,
        /// New backend.
        to: BackendId,
    },
    /// Affinity, algorithm, buffering, TLS or route kind changed.
    PolicyChanged(RouteKey),
}

impl fmt::Display for StructuralChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RouteAdded(key) => write!(f, "route {key} added"),
            Self::RouteRemoved(key) => write!(f, "route {key} removed"),
            Self::BackendChanged { route, from, to } => {
                write!(f, "route {route} moved from {from} to {to}")
            }
            Self::PolicyChanged(key) => write!(f, "route {key} policy changed"),
        }
    }
}

/// Classification of the difference between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    /// Nothing to do.
    Noop,
    /// Only backend membership changed; routes and policy are identical.
    EndpointsOnly {
        /// Backends whose membership changed, in order.
        backends: Vec<BackendId>,
    },
    /// Anything else; requires a full reload.
    Structural {
        /// Every structural difference found.
        changes: Vec<StructuralChange>,
    },
}

/// The variant of a [`Diff`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// See [`Diff::Noop`].
    Noop,
    /// See [`Diff::EndpointsOnly`].
    EndpointsOnly,
    /// See [`Diff::Structural`].
    Structural,
}

impl Diff {
    /// The variant of this diff.
    pub fn kind(&self) -> DiffKind {
        match self {
            Self::Noop => DiffKind::Noop,
            Self::EndpointsOnly { .. } => DiffKind::EndpointsOnly,
            Self::Structural { .. } => DiffKind::Structural,
        }
    }
}

/// Classify the move from `previous` to `current`.
///
/// Pure and deterministic. Route comparison is by identity and ignores
/// order. Backend sets are only compared for backends referenced by a route,
/// and only by membership.
pub fn classify(previous: &ConfigurationSnapshot, current: &ConfigurationSnapshot) -> Diff {
    let changes = route_changes(previous.routes(), current.routes());
    if !changes.is_empty() {
        return Diff::Structural { changes };
    }

    let backends: Vec<BackendId> = current
        .referenced_backends()
        .into_iter()
        .filter(|id| {
            match (previous.backend(id), current.backend(id)) {
                (Some(old), Some(new)) => !old.same_members(new),
                (None, None) => false,
                // A missing set is an empty one.
                (Some(set), None) | (None, Some(set)) => !set.is_empty(),
            }
        })
        .cloned()
        .collect();

    if backends.is_empty() {
        Diff::Noop
    } else {
        Diff::EndpointsOnly { backends }
    }
}

fn route_changes(previous: &[Route], current: &[Route]) -> Vec<StructuralChange> {
    let before: HashMap<RouteKey, &Route> = previous.iter().map(|r| (r.key(), r)).collect();
    let mut changes = Vec::new();
    let mut matched = 0;

    for route in current {
        let key = route.key();
        match before.get(&key) {
            None => changes.push(StructuralChange::RouteAdded(key)),
            Some(old) => {
                matched += 1;
                if old.backend != route.backend {
                    changes.push(StructuralChange::BackendChanged {
                        route: key,
                        from: old.backend.clone(),
                        to: route.backend.clone(),
                    });
                } else if old.kind != route.kind || old.policy != route.policy {
                    changes.push(StructuralChange::PolicyChanged(key));
                }
            }
        }
    }

    if matched < previous.len() {
        let after: HashSet<RouteKey> = current.iter().map(Route::key).collect();
        changes.extend(
            previous
                .iter()
                .map(Route::key)
                .filter(|key| !after.contains(key))
                .map(StructuralChange::RouteRemoved),
        );
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::backend::BackendSet;
    use crate::domain::route::{Affinity, Algorithm, CookieAffinity, RoutePolicy, TlsBinding};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 8080))
    }

    fn snapshot(routes: Vec<Route>, sets: Vec<(&str, u64, Vec<u8>)>) -> ConfigurationSnapshot {
        let backends: BTreeMap<BackendId, BackendSet> = sets
            .into_iter()
            .map(|(id, generation, hosts)| {
                (
                    BackendId::from(id),
                    BackendSet::new(generation, hosts.into_iter().map(addr)),
                )
            })
            .collect();
        ConfigurationSnapshot::new(routes, backends).unwrap()
    }

    fn foo() -> Route {
        Route::new("foo.com", "/", BackendId::from("echo"))
    }

    #[test]
    fn test_identical_snapshots_are_noop() {
        let s = snapshot(vec![foo()], vec![("echo", 1, vec![1, 2])]);
        assert_eq!(classify(&s, &s), Diff::Noop);
    }

    #[test]
    fn test_membership_change_is_endpoints_only() {
        let before = snapshot(vec![foo()], vec![("echo", 1, vec![1])]);
        let after = snapshot(vec![foo()], vec![("echo", 2, vec![1, 2])]);
        assert_eq!(
            classify(&before, &after),
            Diff::EndpointsOnly {
                backends: vec![BackendId::from("echo")]
            }
        );
    }

    #[test]
    fn test_route_order_is_ignored() {
        let bar = Route::new("bar.com", "/", BackendId::from("echo"));
        let before = snapshot(vec![foo(), bar.clone()], vec![("echo", 1, vec![1])]);
        let after = snapshot(vec![bar, foo()], vec![("echo", 1, vec![1])]);
        assert_eq!(classify(&before, &after), Diff::Noop);
    }

    #[test]
    fn test_unreferenced_backend_changes_are_ignored() {
        let before = snapshot(vec![foo()], vec![("echo", 1, vec![1]), ("idle", 1, vec![5])]);
        let after = snapshot(vec![foo()], vec![("echo", 1, vec![1]), ("idle", 2, vec![6])]);
        assert_eq!(classify(&before, &after), Diff::Noop);
    }

    #[test]
    fn test_repointed_route_is_structural() {
        let before = snapshot(vec![foo()], vec![("echo", 1, vec![1]), ("other", 1, vec![1])]);
        let moved = Route::new("foo.com", "/", BackendId::from("other"));
        let after = snapshot(vec![moved], vec![("echo", 1, vec![1]), ("other", 1, vec![1])]);
        assert_eq!(
            classify(&before, &after),
            Diff::Structural {
                changes: vec![StructuralChange::BackendChanged {
                    route: RouteKey::new("foo.com", "/"),
                    from: BackendId::from("echo"),
                    to: BackendId::from("other"),
                }]
            }
        );
    }

    #[test]
    fn test_mixed_batch_is_structural() {
        let before = snapshot(vec![foo()], vec![("echo", 1, vec![1])]);
        let tls = foo().with_policy(RoutePolicy {
            tls: Some(TlsBinding {
                secret: "foo.com".into(),
            }),
            ..RoutePolicy::default()
        });
        let after = snapshot(vec![tls], vec![("echo", 2, vec![1, 2, 3])]);
        assert_eq!(classify(&before, &after).kind(), DiffKind::Structural);
    }

    #[test]
    fn test_added_and_removed_routes_are_reported() {
        let bar = Route::new("bar.com", "/", BackendId::from("echo"));
        let before = snapshot(vec![foo()], vec![("echo", 1, vec![1])]);
        let after = snapshot(vec![bar], vec![("echo", 1, vec![1])]);
        assert_eq!(
            classify(&before, &after),
            Diff::Structural {
                changes: vec![
                    StructuralChange::RouteAdded(RouteKey::new("bar.com", "/")),
                    StructuralChange::RouteRemoved(RouteKey::new("foo.com", "/")),
                ]
            }
        );
    }

    fn policy_strategy() -> impl Strategy<Value = RoutePolicy> {
        (any::<bool>(), any::<bool>(), 1u64..65_536, proptest::option::of("[a-z]{1,8}")).prop_map(
            |(ewma, sticky, body, tls)| RoutePolicy {
                load_balance: if ewma { Algorithm::Ewma } else { Algorithm::RoundRobin },
                affinity: if sticky {
                    Affinity::Cookie(CookieAffinity::new("route"))
                } else {
                    Affinity::None
                },
                buffering: crate::domain::route::Buffering {
                    client_body_buffer_size: body,
                    proxy_buffering: false,
                },
                tls: tls.map(|secret| TlsBinding { secret }),
            },
        )
    }

    proptest! {
        #[test]
        fn prop_classify_self_is_noop(
            hosts in proptest::collection::btree_set("[a-z]{1,6}", 0..6),
            members in proptest::collection::vec(1u8..50, 0..8),
        ) {
            let routes = hosts
                .iter()
                .map(|h| Route::new(format!("{h}.com"), "/", BackendId::from("echo")))
                .collect();
            let s = snapshot(routes, vec![("echo", 1, members)]);
            prop_assert_eq!(classify(&s, &s), Diff::Noop);
        }

        #[test]
        fn prop_membership_only_is_endpoints_only(
            before in proptest::collection::btree_set(1u8..50, 0..8),
            after in proptest::collection::btree_set(1u8..50, 0..8),
        ) {
            prop_assume!(before != after);
            let old = snapshot(vec![foo()], vec![("echo", 1, before.into_iter().collect())]);
            let new = snapshot(vec![foo()], vec![("echo", 2, after.into_iter().collect())]);
            prop_assert_eq!(classify(&old, &new).kind(), DiffKind::EndpointsOnly);
        }

        #[test]
        fn prop_policy_change_wins_over_endpoints(
            a in policy_strategy(),
            b in policy_strategy(),
            grow in any::<bool>(),
        ) {
            prop_assume!(a != b);
            let members = if grow { vec![1, 2] } else { vec![1] };
            let old = snapshot(vec![foo().with_policy(a)], vec![("echo", 1, vec![1])]);
            let new = snapshot(vec![foo().with_policy(b)], vec![("echo", 2, members)]);
            prop_assert_eq!(classify(&old, &new).kind(), DiffKind::Structural);
        }
    }
}
