//! Connection status surface in the `stub_status` text layout.
//!
//! ```text
//! Active connections: 2
//! server accepts handled requests
//!  105 105 311
//! Reading: 0 Writing: 1 Waiting: 1
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// The status body could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusParseError {
    /// Fewer than three lines.
    #[error("status body is truncated")]
    Truncated,

    /// The counters line does not start with a number.
    #[error("invalid accepted counter {0:?}")]
    InvalidCounter(String),
}

/// One reading of the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Open client connections.
    pub active: u64,
    /// Connections accepted since start.
    pub accepted: u64,
    /// Connections handled since start.
    pub handled: u64,
    /// Requests served since start.
    pub requests: u64,
    /// Connections reading a request.
    pub reading: u64,
    /// Connections writing a response.
    pub writing: u64,
    /// Idle keep-alive connections.
    pub waiting: u64,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Active connections: {}", self.active)?;
        writeln!(f, "server accepts handled requests")?;
        writeln!(f, " {} {} {}", self.accepted, self.handled, self.requests)?;
        writeln!(
            f,
            "Reading: {} Writing: {} Waiting: {}",
            self.reading, self.writing, self.waiting
        )
    }
}

/// Read the cumulative accepted-connections counter: the first field of the
/// third line.
pub fn parse_accepted(body: &str) -> Result<u64, StatusParseError> {
    let line = body.lines().nth(2).ok_or(StatusParseError::Truncated)?;
    let field = line
        .split_whitespace()
        .next()
        .ok_or(StatusParseError::Truncated)?;
    field
        .parse()
        .map_err(|_| StatusParseError::InvalidCounter(field.to_string()))
}

/// Live connection counters shared by the admin server's connection tasks.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    active: AtomicU64,
    accepted: AtomicU64,
    requests: AtomicU64,
    in_flight: AtomicU64,
}

impl ConnectionCounters {
    /// All counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection was accepted. The returned guard marks it closed on drop.
    pub fn accept(&self) -> ConnectionGuard<'_> {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { counters: self }
    }

    /// A request started. The returned guard marks it finished on drop.
    pub fn request(&self) -> RequestGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        RequestGuard { counters: self }
    }

    /// Current values.
    pub fn report(&self) -> StatusReport {
        let active = self.active.load(Ordering::Relaxed);
        let accepted = self.accepted.load(Ordering::Relaxed);
        let writing = self.in_flight.load(Ordering::Relaxed).min(active);
        StatusReport {
            active,
            accepted,
            handled: accepted,
            requests: self.requests.load(Ordering::Relaxed),
            reading: 0,
            writing,
            waiting: active - writing,
        }
    }
}

/// Decrements the active connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard<'a> {
    counters: &'a ConnectionCounters,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight request count on drop.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    counters: &'a ConnectionCounters,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stub_status() {
        let body = "Active connections: 1 \nserver accepts handled requests\n 255 255 1024 \nReading: 0 Writing: 1 Waiting: 0 \n";
        assert_eq!(parse_accepted(body), Ok(255));
    }

    #[test]
    fn test_parse_rejects_short_or_garbled_body() {
        assert_eq!(
            parse_accepted("Active connections: 1\n"),
            Err(StatusParseError::Truncated)
        );
        assert_eq!(
            parse_accepted("a\nb\n x 1 2\n"),
            Err(StatusParseError::InvalidCounter("x".to_string()))
        );
    }

    #[test]
    fn test_rendered_report_parses_back() {
        let counters = ConnectionCounters::new();
        let first = counters.accept();
        {
            let _second = counters.accept();
            let _request = counters.request();
            let report = counters.report();
            assert_eq!(report.active, 2);
            assert_eq!(report.writing, 1);
            assert_eq!(report.waiting, 1);
        }
        drop(first);

        let report = counters.report();
        assert_eq!(report.active, 0);
        assert_eq!(report.requests, 1);
        assert_eq!(parse_accepted(&report.to_string()), Ok(2));
    }
}
