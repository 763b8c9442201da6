//! Per-identity token bucket admission control.
//!
//! Each [`ServerIdentity`] owns one [`TokenBucket`]. Tokens refill in whole
//! ticks of `refill_amount` every `refill_interval`, capped at `capacity`.
//! Callers check with [`RateLimiter::can_consume`] and then take tokens with
//! [`RateLimiter::consume`]; [`RateLimiter::acquire`] wraps both and sleeps for
//! [`RateLimiter::estimated_delay`] instead of spinning.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::identity::ServerIdentity;

/// Lower bound on an admission sleep, so a zero estimate cannot spin.
const MIN_ADMISSION_WAIT: Duration = Duration::from_millis(10);

/// Parameters for one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Maximum number of tokens held.
    pub capacity: u32,
    /// Tokens present when the bucket is created.
    pub initial_tokens: u32,
    /// Tokens taken per requested unit.
    pub weight: u32,
    /// Tokens added per tick.
    pub refill_amount: u32,
    /// Tick length.
    pub refill_interval: Duration,
}

impl BucketConfig {
    /// Full bucket of `capacity` refilling `refill_amount` every `refill_interval`.
    pub fn new(capacity: u32, refill_amount: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            initial_tokens: capacity,
            weight: 1,
            refill_amount,
            refill_interval,
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::new(25, 3, Duration::from_secs(1))
    }
}

/// Errors from limiter lookups and consumption.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// No bucket is registered for the identity.
    #[error("no rate limit bucket registered for {0}")]
    UnknownIdentity(String),

    /// `consume` was called without enough tokens.
    #[error("not enough tokens: requested {requested}, available {available}")]
    InsufficientTokens {
        /// Tokens the call would take.
        requested: u32,
        /// Tokens currently held.
        available: u32,
    },

    /// The request can never be admitted by this bucket.
    #[error("request cost {requested} exceeds bucket capacity {capacity}")]
    ExceedsCapacity {
        /// Tokens the call would take.
        requested: u32,
        /// Bucket capacity.
        capacity: u32,
    },
}

/// Whether [`RateLimiter::acquire`] waits for tokens or fails immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Sleep until enough tokens have refilled.
    Wait,
    /// Fail with [`ClientError::AdmissionRejected`].
    Reject,
}

/// A single token bucket. Invariant: `current_tokens <= capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_amount: u32,
    refill_interval: Duration,
    weight: u32,
    current_tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: &BucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_amount: config.refill_amount.max(1),
            refill_interval: config.refill_interval,
            weight: config.weight.max(1),
            current_tokens: config.initial_tokens.min(config.capacity),
            last_refill: Instant::now(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens held as of the last refresh.
    pub fn current_tokens(&self) -> u32 {
        self.current_tokens
    }

    /// Token cost of `amount` units.
    pub fn cost(&self, amount: u32) -> u32 {
        amount.saturating_mul(self.weight)
    }

    /// Tokens and tick anchor as they would be at `now`, without mutating.
    fn projected(&self, now: Instant) -> (u32, Instant) {
        if self.refill_interval.is_zero() {
            return (self.capacity, now);
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let ticks = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if ticks == 0 {
            return (self.current_tokens, self.last_refill);
        }

        let added = u64::try_from(ticks)
            .unwrap_or(u64::MAX)
            .saturating_mul(u64::from(self.refill_amount));
        let tokens = (u64::from(self.current_tokens).saturating_add(added))
            .min(u64::from(self.capacity)) as u32;

        if tokens >= self.capacity {
            (tokens, now)
        } else {
            // Not full, so ticks < capacity and fits in u32. Keeps the partial tick.
            (tokens, self.last_refill + self.refill_interval * ticks as u32)
        }
    }

    /// Apply elapsed refill ticks.
    pub fn refresh(&mut self) {
        let (tokens, anchor) = self.projected(Instant::now());
        self.current_tokens = tokens;
        self.last_refill = anchor;
    }

    /// Whether `amount` units could be consumed right now.
    pub fn can_consume(&self, amount: u32) -> bool {
        let (tokens, _) = self.projected(Instant::now());
        tokens >= self.cost(amount)
    }

    /// Take `amount` units worth of tokens.
    pub fn consume(&mut self, amount: u32) -> Result<(), LimiterError> {
        self.refresh();
        let cost = self.cost(amount);
        if self.current_tokens < cost {
            return Err(LimiterError::InsufficientTokens {
                requested: cost,
                available: self.current_tokens,
            });
        }
        self.current_tokens -= cost;
        Ok(())
    }

    /// Consume `amount` if enough tokens are available, in one step.
    pub fn try_consume(&mut self, amount: u32) -> bool {
        self.refresh();
        let cost = self.cost(amount);
        if self.current_tokens < cost {
            return false;
        }
        self.current_tokens -= cost;
        true
    }

    /// Time until `amount` units become available.
    pub fn estimated_delay(&self, amount: u32) -> Duration {
        let now = Instant::now();
        let (tokens, anchor) = self.projected(now);
        let needed = self.cost(amount).min(self.capacity);
        if tokens >= needed {
            return Duration::ZERO;
        }
        let ticks = (needed - tokens).div_ceil(self.refill_amount);
        (self.refill_interval * ticks).saturating_sub(now.saturating_duration_since(anchor))
    }

    /// Empty the bucket and restart the refill clock.
    pub fn drain(&mut self) {
        self.current_tokens = 0;
        self.last_refill = Instant::now();
    }

    pub fn is_full(&mut self) -> bool {
        self.refresh();
        self.current_tokens >= self.capacity
    }
}

/// Buckets keyed by server identity.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<ServerIdentity, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the bucket for `identity`.
    pub fn add_bucket(&self, identity: &ServerIdentity, config: &BucketConfig) {
        self.buckets
            .lock()
            .insert(identity.clone(), TokenBucket::new(config));
    }

    /// Drop the bucket for `identity`. Returns whether one existed.
    pub fn remove(&self, identity: &ServerIdentity) -> bool {
        self.buckets.lock().remove(identity).is_some()
    }

    fn with_bucket<R>(
        &self,
        identity: &ServerIdentity,
        f: impl FnOnce(&mut TokenBucket) -> R,
    ) -> Result<R, LimiterError> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .get_mut(identity)
            .ok_or_else(|| LimiterError::UnknownIdentity(identity.to_string()))?;
        Ok(f(bucket))
    }

    pub fn can_consume(&self, identity: &ServerIdentity, amount: u32) -> Result<bool, LimiterError> {
        self.with_bucket(identity, |bucket| bucket.can_consume(amount))
    }

    pub fn consume(&self, identity: &ServerIdentity, amount: u32) -> Result<(), LimiterError> {
        self.with_bucket(identity, |bucket| bucket.consume(amount))?
    }

    /// Check and consume under one lock. Returns whether tokens were taken.
    pub fn try_consume(&self, identity: &ServerIdentity, amount: u32) -> Result<bool, LimiterError> {
        self.with_bucket(identity, |bucket| bucket.try_consume(amount))
    }

    pub fn estimated_delay(
        &self,
        identity: &ServerIdentity,
        amount: u32,
    ) -> Result<Duration, LimiterError> {
        self.with_bucket(identity, |bucket| bucket.estimated_delay(amount))
    }

    /// Current token count after applying elapsed refills.
    pub fn tokens(&self, identity: &ServerIdentity) -> Result<u32, LimiterError> {
        self.with_bucket(identity, |bucket| {
            bucket.refresh();
            bucket.current_tokens()
        })
    }

    pub fn is_full(&self, identity: &ServerIdentity) -> Result<bool, LimiterError> {
        self.with_bucket(identity, TokenBucket::is_full)
    }

    pub fn drain(&self, identity: &ServerIdentity) -> Result<(), LimiterError> {
        self.with_bucket(identity, TokenBucket::drain)
    }

    /// Take `amount`, sleeping for the estimated delay while short unless
    /// `policy` is [`AdmissionPolicy::Reject`].
    pub async fn acquire(
        &self,
        identity: &ServerIdentity,
        amount: u32,
        policy: AdmissionPolicy,
    ) -> Result<(), ClientError> {
        let (cost, capacity) =
            self.with_bucket(identity, |bucket| (bucket.cost(amount), bucket.capacity()))?;
        if cost > capacity {
            return Err(LimiterError::ExceedsCapacity {
                requested: cost,
                capacity,
            }
            .into());
        }

        loop {
            if self.try_consume(identity, amount)? {
                return Ok(());
            }
            if policy == AdmissionPolicy::Reject {
                return Err(ClientError::AdmissionRejected);
            }
            let delay = self.estimated_delay(identity, amount)?;
            tracing::debug!(%identity, amount, ?delay, "waiting for rate limit tokens");
            tokio::time::sleep(delay.max(MIN_ADMISSION_WAIT)).await;
        }
    }
}
