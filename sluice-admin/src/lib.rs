//! Sluice admin control plane.
//!
//! The control channel wire protocol, the connection status surface, and the
//! data plane side admin server that applies backend-set updates to a live
//! routing table.

pub mod protocol;
pub mod server;
pub mod status;

pub use protocol::{BackendEntry, ProtocolError, UpdateAck, UpdateBackendsRequest};
pub use server::{AdminServer, AdminState};
pub use status::{parse_accepted, ConnectionCounters, StatusParseError, StatusReport};
