//! Exponential backoff for transient faults.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff with a multiplier and a cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            current: initial,
            attempts: 0,
            max_attempts: None,
        }
    }

    /// Stop after `n` delays instead of retrying forever.
    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// The next delay, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.current;
        let next = self.current.mul_f64(self.multiplier);
        self.current = next.min(self.max);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

/// Run `op` until it succeeds or the backoff budget is spent, sleeping
/// between attempts. The last error is returned on exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut backoff: ExponentialBackoff,
    what: &str,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(op = what, error = %err, ?delay, "retrying after error");
                    sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}
