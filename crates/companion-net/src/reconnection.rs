//! Retry cadence for connection establishment.
//!
//! [`ReconnectState`] hands out the delay before each retry and reports when
//! the retry budget is spent. The default mirrors the companion app's
//! behaviour: a fixed 20 s pause, retrying forever. Exponential backoff and
//! jitter are available for callers that want them.

use std::time::Duration;

use rand::Rng;

/// Configuration for connection retries.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 20 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt. Default: 1.0.
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts. Default: 5 min.
    pub max_delay: Duration,
    /// Retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Jitter factor (0.0–1.0), applied as ±jitter to the delay. Default: 0.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(20),
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(300),
            max_retries: None,
            jitter: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Constant `delay` between attempts.
    pub fn fixed(delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay.max(Duration::from_secs(300)),
            max_retries,
            ..Default::default()
        }
    }
}

/// Tracks the retry count and computes the next delay.
#[derive(Debug)]
pub struct ReconnectState {
    config: ReconnectConfig,
    retries: u32,
    current_delay: Duration,
}

impl ReconnectState {
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            retries: 0,
            current_delay: initial,
        }
    }

    /// Delay before the next retry, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries
            && self.retries >= max
        {
            return None;
        }

        let base = self.current_delay;
        self.retries = self.retries.saturating_add(1);

        let jittered = if self.config.jitter > 0.0 {
            let mut rng = rand::rng();
            let factor = rng.random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}
