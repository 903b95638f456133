//! Delay policies between session attempts.

use rand::Rng;
use std::time::Duration;

/// Computes the delay before the next dial.
///
/// `attempt` is the 1-based count of consecutive failures since the last
/// session that reached `Active`.
pub trait BackoffStrategy: Send + Sync {
    fn next(&self, attempt: u32) -> Duration;
}

/// Same delay after every failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl BackoffStrategy for FixedBackoff {
    fn next(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Exponential backoff with jitter: `base * 2^(attempt-1) + jitter`, capped
/// at `max`. The cap applies after jitter is added.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl ExponentialBackoff {
    /// Compute the delay with a caller-supplied RNG.
    pub fn next_with_rng(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let jitter_range = self.jitter.as_millis() as u64;

        let multiplier = 2_u64.saturating_pow(attempt.saturating_sub(1));
        let delay_ms = base_ms.saturating_mul(multiplier);
        let jitter_ms = if jitter_range == 0 {
            0
        } else {
            rng.random_range(0..jitter_range)
        };

        Duration::from_millis(delay_ms.saturating_add(jitter_ms).min(max_ms))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next(&self, attempt: u32) -> Duration {
        self.next_with_rng(attempt, &mut rand::rng())
    }
}
