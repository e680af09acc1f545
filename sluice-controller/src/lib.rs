//! Sluice Controller
//!
//! Keeps a running proxy's configuration in step with routing intent. Change
//! events are folded into snapshots, each snapshot is classified against the
//! last applied one, and endpoint-only changes are pushed over the control
//! channel while everything else goes through a full reload. Also hosts the
//! shutdown drain detector.

pub mod client;
pub mod config;
pub mod connection_pool;
pub mod drain;
pub mod error;
pub mod intake;
pub mod logging;
pub mod pusher;
pub mod reconciler;
pub mod reload;

pub use config::ControllerConfig;
pub use drain::{DrainConfig, DrainOutcome, StatusEndpoint};
pub use error::{ClientError, ConfigError, DrainError, PushError, ReloadError};
pub use pusher::DynamicUpdatePusher;
pub use reconciler::{CycleOutcome, Reconciler, SnapshotPublisher};
pub use reload::ReloadController;
