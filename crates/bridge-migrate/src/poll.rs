//! Polling with exponential backoff for asynchronous remote jobs.
//!
//! Table queries against the Synapse REST API run as asynchronous jobs: the
//! client starts a job and then polls until the result is ready. Polling an
//! accepted job is not a retry; a failed call is returned immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// Configuration for polling behavior.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay before the second poll.
    pub initial_delay: Duration,
    /// Maximum delay between polls.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every pending poll.
    pub backoff_multiplier: f64,
    /// Give up once this much time has elapsed.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PollConfig {
    /// Polls back to back, for tests against mock servers.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            timeout: Duration::from_secs(5),
        }
    }

    /// Calculates the delay before poll number `attempt` (0 = first poll).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);

        Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Polls `operation` until it yields a value.
///
/// `Ok(None)` means the job is still running. Errors end polling at once.
pub async fn poll_until_ready<F, Fut, T>(
    config: &PollConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        if let Some(value) = operation().await? {
            debug!("{}: ready after {} polls", operation_name, attempt + 1);
            return Ok(value);
        }

        if started.elapsed() >= config.timeout {
            return Err(Error::Query(format!(
                "{}: still pending after {:?}",
                operation_name, config.timeout
            )));
        }
        attempt = attempt.saturating_add(1);
    }
}
