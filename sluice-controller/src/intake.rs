//! Change-event intake.
//!
//! Reads [`ChangeEvent`]s as newline-delimited JSON, folds them into the
//! desired state and publishes a snapshot whenever the input runs dry. Every
//! event already buffered is applied before publishing, so a burst becomes a
//! single snapshot.

use sluice_core::{ChangeEvent, DesiredState};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, info, warn};

use crate::reconciler::SnapshotPublisher;

/// Counters for one intake run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeStats {
    /// Events applied.
    pub events: u64,
    /// Lines that could not be parsed.
    pub skipped: u64,
    /// Snapshots published.
    pub published: u64,
}

/// Consume `reader` until end of input, publishing snapshots as it goes.
///
/// Returns early if the reconciler has gone away.
pub async fn run<R>(reader: R, state: &mut DesiredState, publisher: &SnapshotPublisher) -> io::Result<IntakeStats>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut stats = IntakeStats::default();
    let mut dirty = false;
    let mut line = String::new();
    let mut line_no = 0u64;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        line_no += 1;

        let trimmed = line.trim();
        if !trimmed.is_empty() {
            match serde_json::from_str::<ChangeEvent>(trimmed) {
                Ok(event) => {
                    stats.events += 1;
                    dirty |= state.apply(event);
                }
                Err(err) => {
                    stats.skipped += 1;
                    warn!(line = line_no, error = %err, "skipping malformed change event");
                }
            }
        }

        if dirty && reader.buffer().is_empty() {
            if !publisher.publish(state.snapshot()) {
                debug!("reconciler gone, stopping intake");
                return Ok(stats);
            }
            stats.published += 1;
            dirty = false;
        }
    }

    if dirty && publisher.publish(state.snapshot()) {
        stats.published += 1;
    }
    info!(
        events = stats.events,
        skipped = stats.skipped,
        published = stats.published,
        "change event input closed"
    );
    Ok(stats)
}
