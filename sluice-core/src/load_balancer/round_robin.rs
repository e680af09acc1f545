//! Round-robin cursor shared by every worker serving a route.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A per-route cursor over a stable endpoint order.
///
/// The cursor always points at the next index to hand out. It is advanced
/// with a single atomic update, so concurrent selections never hand out the
/// same slot twice within one cycle.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// A cursor starting at the first endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next index for a set of `len` endpoints.
    ///
    /// A cursor left beyond `len` by a shrinking update is clamped, which
    /// restarts the cycle at the first endpoint.
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }

        let advance = |cursor: usize| {
            let index = if cursor >= len { 0 } else { cursor };
            Some((index + 1) % len)
        };

        let previous = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, advance)
        {
            Ok(previous) | Err(previous) => previous,
        };

        Some(if previous >= len { 0 } else { previous })
    }

    /// Clamp the cursor after the endpoint count changed.
    pub fn clamp(&self, len: usize) {
        let _ = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                (cursor >= len && cursor != 0).then_some(0)
            });
    }

    /// Index the next selection will start from.
    pub fn position(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }
}
