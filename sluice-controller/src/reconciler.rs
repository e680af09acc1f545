//! The reconciliation loop.
//!
//! One cycle at a time: classify the newest desired snapshot against the
//! last applied one, then push, reload, or do nothing. Snapshots published
//! while a cycle runs overwrite each other in a single slot, so the next
//! cycle always starts from the latest one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice_core::{classify, ConfigurationSnapshot, Diff};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{PushError, ReloadError};
use crate::pusher::DynamicUpdatePusher;
use crate::reload::ReloadController;

/// Delivers endpoint-only changes to the data plane.
#[async_trait]
pub trait BackendPusher: Send + Sync {
    /// Apply an endpoint-only `diff` of `snapshot` without a reload.
    async fn push(&self, diff: &Diff, snapshot: &ConfigurationSnapshot) -> Result<(), PushError>;
}

/// Replaces the data plane's whole configuration.
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Install `snapshot` and reload.
    async fn reload(&self, snapshot: &ConfigurationSnapshot) -> Result<(), ReloadError>;
}

#[async_trait]
impl BackendPusher for DynamicUpdatePusher {
    async fn push(&self, diff: &Diff, snapshot: &ConfigurationSnapshot) -> Result<(), PushError> {
        DynamicUpdatePusher::push(self, diff, snapshot).await.map(drop)
    }
}

#[async_trait]
impl Reloader for ReloadController {
    async fn reload(&self, snapshot: &ConfigurationSnapshot) -> Result<(), ReloadError> {
        ReloadController::reload(self, snapshot).await
    }
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing changed.
    Skipped,
    /// Endpoint changes were pushed without a reload.
    Pushed,
    /// A full reload was performed.
    Reloaded {
        /// The reload followed a failed push.
        escalated: bool,
    },
    /// The reload failed; the previous configuration is still in effect.
    Failed,
}

/// Producer side of the single-slot snapshot channel.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    sender: watch::Sender<Option<Arc<ConfigurationSnapshot>>>,
}

/// Consumer side of the single-slot snapshot channel.
pub type SnapshotReceiver = watch::Receiver<Option<Arc<ConfigurationSnapshot>>>;

impl SnapshotPublisher {
    /// A publisher and the receiver the reconciler listens on.
    pub fn new() -> (Self, SnapshotReceiver) {
        let (sender, receiver) = watch::channel(None);
        (Self { sender }, receiver)
    }

    /// Replace the pending snapshot. Returns `false` once the reconciler
    /// has gone away.
    pub fn publish(&self, snapshot: ConfigurationSnapshot) -> bool {
        self.sender.send(Some(Arc::new(snapshot))).is_ok()
    }
}

/// Drives the data plane towards the desired snapshots.
#[derive(Debug)]
pub struct Reconciler<P, R> {
    pusher: P,
    reloader: R,
    applied: Option<Arc<ConfigurationSnapshot>>,
    retry_interval: Duration,
}

impl<P: BackendPusher, R: Reloader> Reconciler<P, R> {
    /// A reconciler that has not applied anything yet.
    pub fn new(pusher: P, reloader: R) -> Self {
        Self {
            pusher,
            reloader,
            applied: None,
            retry_interval: Duration::from_secs(5),
        }
    }

    /// How long to wait before retrying a failed cycle when nothing newer
    /// arrives.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// The snapshot the data plane is known to be running.
    pub fn applied(&self) -> Option<&ConfigurationSnapshot> {
        self.applied.as_deref()
    }

    /// Run one cycle for `desired`.
    pub async fn sync(&mut self, desired: Arc<ConfigurationSnapshot>) -> CycleOutcome {
        let Some(previous) = self.applied.as_deref() else {
            info!("first sync of configuration");
            return self.reload(desired, false).await;
        };

        match classify(previous, &desired) {
            Diff::Noop => {
                info!("no configuration changes, skipping");
                CycleOutcome::Skipped
            }
            diff @ Diff::EndpointsOnly { .. } => match self.pusher.push(&diff, &desired).await {
                Ok(()) => {
                    info!("dynamic reconfiguration succeeded, skipping reload");
                    self.applied = Some(desired);
                    CycleOutcome::Pushed
                }
                Err(err) => {
                    warn!(error = %err, "could not dynamically reconfigure");
                    self.reload(desired, true).await
                }
            },
            Diff::Structural { changes } => {
                for change in &changes {
                    debug!(%change, "structural change");
                }
                self.reload(desired, false).await
            }
        }
    }

    async fn reload(&mut self, desired: Arc<ConfigurationSnapshot>, escalated: bool) -> CycleOutcome {
        info!(escalated, "backend reload required");
        match self.reloader.reload(&desired).await {
            Ok(()) => {
                info!("backend successfully reloaded");
                self.applied = Some(desired);
                CycleOutcome::Reloaded { escalated }
            }
            Err(err) => {
                error!(error = %err, malformed = err.is_malformed(), "backend reload failed");
                CycleOutcome::Failed
            }
        }
    }

    /// Process snapshots until every publisher is dropped.
    ///
    /// A failed cycle is retried after the retry interval unless a newer
    /// snapshot arrives first.
    pub async fn run(mut self, mut receiver: SnapshotReceiver) {
        let mut pending: Option<Arc<ConfigurationSnapshot>> = None;

        loop {
            let next = if let Some(failed) = pending.take() {
                tokio::select! {
                    changed = receiver.changed() => match changed {
                        Ok(()) => latest(&mut receiver),
                        Err(_) => break,
                    },
                    () = tokio::time::sleep(self.retry_interval) => Some(failed),
                }
            } else {
                match receiver.changed().await {
                    Ok(()) => latest(&mut receiver),
                    Err(_) => break,
                }
            };

            let Some(desired) = next else { continue };
            if self.sync(Arc::clone(&desired)).await == CycleOutcome::Failed {
                pending = Some(desired);
            }
        }
        debug!("snapshot channel closed, reconciler stopping");
    }
}

fn latest(receiver: &mut SnapshotReceiver) -> Option<Arc<ConfigurationSnapshot>> {
    receiver.borrow_and_update().clone()
}
