//! Randomized delays between polls and deliveries.

use std::time::Duration;

use rand::Rng;

/// A delay of `base` plus a uniform random amount below `spread`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    pub base: Duration,
    pub spread: Duration,
}

impl Jitter {
    pub const ZERO: Jitter = Jitter {
        base: Duration::ZERO,
        spread: Duration::ZERO,
    };

    pub const fn new(base: Duration, spread: Duration) -> Self {
        Self { base, spread }
    }

    /// Draw one delay.
    pub fn sample(&self) -> Duration {
        let spread_ms = self.spread.as_millis() as u64;
        if spread_ms == 0 {
            return self.base;
        }
        self.base + Duration::from_millis(rand::thread_rng().gen_range(0..spread_ms))
    }

    /// Sleep for one sampled delay.
    pub async fn wait(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Delays the scheduler inserts between steps to stay polite to the forum
/// and the chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    /// Between two source polls.
    pub inter_source: Jitter,
    /// After each successful delivery.
    pub inter_delivery: Jitter,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            inter_source: Jitter::new(Duration::from_secs(15), Duration::from_secs(5)),
            inter_delivery: Jitter::new(Duration::from_secs(2), Duration::from_secs(3)),
        }
    }
}

impl PacingPolicy {
    /// No delays at all.
    pub fn none() -> Self {
        Self {
            inter_source: Jitter::ZERO,
            inter_delivery: Jitter::ZERO,
        }
    }
}
