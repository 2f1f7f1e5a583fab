use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a bounded number of attempts, applied wherever
/// the listener and reconciler establish sessions. Exhaustion fails the
/// current cycle only; the next scheduled cycle starts fresh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// One delay per attempt, doubling from `initial_delay` and capped at
    /// `max_delay`.
    pub fn delays(self) -> impl Iterator<Item = Duration> {
        (0..self.max_attempts).map(move |attempt| {
            let factor = 2u32.saturating_pow(attempt);
            self.initial_delay
                .checked_mul(factor)
                .map_or(self.max_delay, |delay| delay.min(self.max_delay))
        })
    }
}
