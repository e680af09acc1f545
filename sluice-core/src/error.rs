//! Error types for snapshot construction, selection and live updates.

use thiserror::Error;

use crate::domain::backend::BackendId;
use crate::domain::route::RouteKey;

/// A snapshot violated one of its structural invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Two routes share the same `(host, path)` identity.
    #[error("duplicate route {0}")]
    DuplicateRoute(RouteKey),
}

/// No endpoint could be chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    /// The route's backend set is empty.
    #[error("no available backend for route {route}")]
    NoAvailableBackend {
        /// Route the request matched.
        route: RouteKey,
    },

    /// No route matches the request and there is no default backend.
    #[error("no route for {host}{path}")]
    NoRoute {
        /// Requested host.
        host: String,
        /// Requested path.
        path: String,
    },
}

/// A backend-set update was refused by the live routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The offered generation is older than the one already applied.
    #[error("stale update for backend {backend}: offered generation {offered}, current {current}")]
    Stale {
        /// Backend the update targeted.
        backend: BackendId,
        /// Generation currently applied.
        current: u64,
        /// Generation carried by the update.
        offered: u64,
    },

    /// Same generation, different membership.
    #[error("conflicting membership for backend {backend} at generation {generation}")]
    GenerationConflict {
        /// Backend the update targeted.
        backend: BackendId,
        /// Generation both sets claim.
        generation: u64,
    },
}
