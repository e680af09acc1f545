//! Domain models: routes, backend sets, snapshots and the live routing table.

pub mod backend;
pub mod event;
pub mod route;
pub mod routing;
pub mod snapshot;
pub mod state;
