//! Bounded exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const INITIAL_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry schedule: the delay doubles after every failed attempt up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Backoff {
    pub fn new(attempts: u32) -> Self {
        Self {
            initial: INITIAL_DELAY,
            max: MAX_DELAY,
            attempts: attempts.max(1),
        }
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Runs `op` until it succeeds, fails permanently or runs out of attempts
///
/// Only errors for which `is_transient` holds are retried. Cancellation during
/// a wait returns the last error.
pub async fn with_backoff<T, E, F, Fut>(
    backoff: Backoff,
    cancel: &CancellationToken,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{} succeeded after {} attempt(s)", what, attempt);
                }
                return Ok(value);
            }
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) => {
                if attempt >= backoff.attempts {
                    error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }

                let delay = backoff.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, backoff.attempts, e, delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
