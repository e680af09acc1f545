//! Change events delivered by the external watcher.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::domain::backend::BackendId;
use crate::domain::route::Route;

/// What happened to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Resource appeared.
    Added,
    /// Resource changed.
    Updated,
    /// Resource disappeared.
    Removed,
}

/// The resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    /// A routing rule.
    Route(Route),
    /// The healthy endpoints of a backend.
    Backend {
        /// Backend identity.
        id: BackendId,
        /// Healthy endpoints, already filtered by health checking.
        #[serde(default)]
        endpoints: Vec<SocketAddr>,
    },
}

/// One observed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Affected resource.
    pub resource: Resource,
}

impl ChangeEvent {
    /// A route was added or updated.
    pub fn upsert_route(route: Route) -> Self {
        Self {
            kind: ChangeKind::Updated,
            resource: Resource::Route(route),
        }
    }

    /// A route was removed.
    pub fn remove_route(route: Route) -> Self {
        Self {
            kind: ChangeKind::Removed,
            resource: Resource::Route(route),
        }
    }

    /// A backend's endpoints changed.
    pub fn endpoints(id: BackendId, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            kind: ChangeKind::Updated,
            resource: Resource::Backend { id, endpoints },
        }
    }
}
