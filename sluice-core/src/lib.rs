//! Sluice core functionality.
//!
//! This crate contains the domain models, the change classifier, and the
//! routing and backend selection primitives shared by the sluice admin
//! surface and controller.

pub mod classify;
pub mod domain;
pub mod error;
pub mod load_balancer;

pub use classify::{classify, Diff, DiffKind, StructuralChange};
pub use domain::backend::{BackendId, BackendSet};
pub use domain::event::{ChangeEvent, ChangeKind, Resource};
pub use domain::route::{Route, RouteKey, RouteKind, RoutePolicy};
pub use domain::routing::{ApplyReport, RoutingTable, SharedRoutingTable};
pub use domain::snapshot::ConfigurationSnapshot;
pub use domain::state::DesiredState;
pub use error::{ApplyError, SelectError, SnapshotError};
