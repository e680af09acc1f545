//! Connection Drain Detector.
//!
//! Runs during controlled shutdown. Polls the data plane's accepted
//! connection counter on a fixed interval and reports whether the instance
//! has stopped receiving new connections. The only outcomes are exit codes:
//! 0 when drained, 1 on timeout or repeated poll failures.

use std::time::Duration;

use async_trait::async_trait;
use hyper::header::HOST;
use hyper::{Method, Request, StatusCode};
use sluice_admin::parse_accepted;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::{connect, empty_body, exchange};
use crate::config::DrainSettings;
use crate::error::{ClientError, DrainError};

/// Detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainConfig {
    /// Absolute deadline for the whole run.
    pub max_wait: Duration,
    /// Poll period.
    pub poll_interval: Duration,
    /// New connections per poll still considered drained.
    pub threshold: u64,
    /// Consecutive failed polls before giving up.
    pub max_retries: u32,
}

impl From<&DrainSettings> for DrainConfig {
    fn from(settings: &DrainSettings) -> Self {
        Self {
            max_wait: Duration::from_millis(settings.max_wait_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            threshold: settings.threshold,
            max_retries: settings.max_retries,
        }
    }
}

/// Source of the cumulative accepted-connections counter.
#[async_trait]
pub trait ConnectionCounter: Send {
    /// Read the counter once.
    async fn accepted(&mut self) -> Result<u64, DrainError>;
}

/// The data plane's status surface, fetched over a fresh connection per
/// poll.
#[derive(Debug, Clone)]
pub struct StatusEndpoint {
    authority: String,
    path: String,
    timeout: Duration,
}

impl StatusEndpoint {
    /// Parse `host:port/path`; an `http://` prefix is accepted.
    pub fn parse(endpoint: &str, timeout: Duration) -> Result<Self, DrainError> {
        let trimmed = endpoint.strip_prefix("http://").unwrap_or(endpoint);
        let (authority, path) = match trimmed.find('/') {
            Some(index) => trimmed.split_at(index),
            None => (trimmed, "/"),
        };
        if authority.is_empty() || !authority.contains(':') {
            return Err(DrainError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self {
            authority: authority.to_string(),
            path: path.to_string(),
            timeout,
        })
    }

    async fn fetch(&self) -> Result<u64, DrainError> {
        let mut sender = connect(&self.authority).await?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.path.as_str())
            .header(HOST, self.authority.as_str())
            .body(empty_body())
            .map_err(ClientError::from)?;

        let (status, body) = exchange(&mut sender, request).await?;
        if status != StatusCode::OK {
            return Err(DrainError::Status(status.as_u16()));
        }
        Ok(parse_accepted(&String::from_utf8_lossy(&body))?)
    }
}

#[async_trait]
impl ConnectionCounter for StatusEndpoint {
    async fn accepted(&mut self) -> Result<u64, DrainError> {
        tokio::time::timeout(self.timeout, self.fetch())
            .await
            .map_err(|_| DrainError::Client(ClientError::Timeout(self.timeout)))?
    }
}

/// Detector state for one shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainState {
    /// Counter value seen on the last successful poll; 0 before the first.
    pub last_observed: u64,
    /// Successful polls so far.
    pub polls: u32,
    /// Failed polls since the last success.
    pub failures: u32,
}

impl DrainState {
    /// Record a successful poll and return the new connections since the
    /// previous one.
    ///
    /// A counter that went backwards yields zero.
    pub fn observe(&mut self, current: u64) -> u64 {
        let new_conns = current.saturating_sub(self.last_observed);
        if self.last_observed > 0 {
            debug!(
                new_conns,
                current,
                last = self.last_observed,
                "saw new connections"
            );
        }
        self.last_observed = current;
        self.polls += 1;
        self.failures = 0;
        new_conns
    }

    /// Record a failed poll and return the consecutive failure count.
    pub fn fail(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }
}

/// How a drain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// New connections fell to the threshold.
    Drained,
    /// Too many consecutive polls failed.
    RetriesExhausted,
    /// The deadline passed first.
    TimedOut,
}

impl DrainOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Drained => 0,
            Self::RetriesExhausted | Self::TimedOut => 1,
        }
    }
}

async fn poll<C: ConnectionCounter>(ticker: &mut Interval, counter: &mut C) -> Result<u64, DrainError> {
    ticker.tick().await;
    counter.accepted().await
}

/// Poll `counter` until the instance is drained, polls keep failing, or
/// `max_wait` elapses.
///
/// The first poll happens one interval after start. The deadline races the
/// ticker, so a slow poll is cut short when it fires.
pub async fn run<C: ConnectionCounter>(config: DrainConfig, mut counter: C) -> DrainOutcome {
    let deadline = tokio::time::sleep(config.max_wait);
    tokio::pin!(deadline);

    let mut ticker = interval_at(Instant::now() + config.poll_interval, config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = DrainState::default();

    loop {
        tokio::select! {
            biased;

            () = &mut deadline => {
                warn!(max_wait_ms = config.max_wait.as_millis() as u64, "timeout reached, exiting");
                return DrainOutcome::TimedOut;
            }
            result = poll(&mut ticker, &mut counter) => match result {
                Ok(current) => {
                    let new_conns = state.observe(current);
                    if new_conns <= config.threshold {
                        info!(new_conns, threshold = config.threshold, "no new connections, exiting");
                        return DrainOutcome::Drained;
                    }
                    debug!(new_conns, threshold = config.threshold, "still receiving connections");
                }
                Err(err) => {
                    let attempt = state.fail();
                    error!(
                        error = %err,
                        attempt,
                        max_retries = config.max_retries,
                        "can not check for new connections"
                    );
                    if attempt >= config.max_retries {
                        return DrainOutcome::RetriesExhausted;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tracing_test::traced_test;

    /// Replays a fixed sequence of poll results, then repeats the last one.
    struct Scripted {
        results: VecDeque<Option<u64>>,
        last: Option<u64>,
        polls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(results: impl IntoIterator<Item = Option<u64>>) -> (Self, Arc<AtomicU32>) {
            let polls = Arc::new(AtomicU32::new(0));
            let scripted = Self {
                results: results.into_iter().collect(),
                last: None,
                polls: Arc::clone(&polls),
            };
            (scripted, polls)
        }

        fn counts(values: &[u64]) -> (Self, Arc<AtomicU32>) {
            Self::new(values.iter().copied().map(Some))
        }
    }

    #[async_trait]
    impl ConnectionCounter for Scripted {
        async fn accepted(&mut self) -> Result<u64, DrainError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.results.pop_front() {
                self.last = next;
            }
            self.last.ok_or(DrainError::Status(503))
        }
    }

    /// A counter that grows by `step` on every poll.
    struct Growing {
        value: u64,
        step: u64,
    }

    #[async_trait]
    impl ConnectionCounter for Growing {
        async fn accepted(&mut self) -> Result<u64, DrainError> {
            self.value += self.step;
            Ok(self.value)
        }
    }

    /// A counter whose status request outlives any deadline.
    struct Stalled;

    #[async_trait]
    impl ConnectionCounter for Stalled {
        async fn accepted(&mut self) -> Result<u64, DrainError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }
    }

    fn config(threshold: u64) -> DrainConfig {
        DrainConfig {
            max_wait: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            threshold,
            max_retries: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_once_deltas_reach_threshold() {
        let start = Instant::now();
        let (counter, polls) = Scripted::counts(&[100, 200, 250, 255, 255]);

        assert_eq!(run(config(1), counter).await, DrainOutcome::Drained);
        assert_eq!(polls.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_equal_to_threshold_is_drained() {
        let (counter, polls) = Scripted::counts(&[100, 200, 250, 270, 290, 305, 315]);

        assert_eq!(run(config(10), counter).await, DrainOutcome::Drained);
        assert_eq!(polls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_counts_against_zero() {
        let (counter, polls) = Scripted::counts(&[2]);

        assert_eq!(run(config(2), counter).await, DrainOutcome::Drained);
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_failures() {
        let start = Instant::now();
        let (counter, polls) = Scripted::new([None]);

        let outcome = run(config(1), counter).await;
        assert_eq!(outcome, DrainOutcome::RetriesExhausted);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let (counter, polls) = Scripted::new([
            None,
            None,
            Some(100),
            None,
            None,
            Some(100),
        ]);

        assert_eq!(run(config(1), counter).await, DrainOutcome::Drained);
        assert_eq!(polls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_reset_is_not_new_traffic() {
        let (counter, _) = Scripted::counts(&[500, 20]);
        assert_eq!(run(config(2), counter).await, DrainOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_forces_exit() {
        let start = Instant::now();
        let outcome = run(config(1), Growing { value: 0, step: 100 }).await;

        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test]
    #[traced_test]
    fn test_new_connections_are_logged_at_debug() {
        let mut state = DrainState::default();
        assert_eq!(state.observe(100), 100);
        assert_eq!(state.observe(150), 50);

        logs_assert(|lines: &[&str]| {
            let seen: Vec<&&str> = lines
                .iter()
                .filter(|line| line.contains("saw new connections"))
                .collect();
            match seen.as_slice() {
                [line] if line.contains("DEBUG") && line.contains("new_conns=50") => Ok(()),
                other => Err(format!("unexpected drain log lines: {other:?}")),
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_short_a_stalled_poll() {
        let start = Instant::now();
        let outcome = run(config(1), Stalled).await;

        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[test]
    fn test_status_endpoint_parsing() {
        let timeout = Duration::from_secs(1);
        let endpoint = StatusEndpoint::parse("127.0.0.1:10246/nginx_status", timeout).unwrap();
        assert_eq!(endpoint.authority, "127.0.0.1:10246");
        assert_eq!(endpoint.path, "/nginx_status");

        let bare = StatusEndpoint::parse("http://localhost:18080", timeout).unwrap();
        assert_eq!(bare.path, "/");

        assert!(StatusEndpoint::parse("/nginx_status", timeout).is_err());
    }
}
