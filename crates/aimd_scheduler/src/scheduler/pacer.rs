use std::time::Duration;

use tokio::time::Instant;

/// Interval used when the bucket cannot refill at all.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Token bucket that gates how often tasks may start.
///
/// The refill rate is owned by the congestion controller and passed in on every call, so the
/// bucket itself only tracks the token count and the last refill instant.
#[derive(Clone, Debug)]
pub(super) struct TokenBucket {
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub(super) fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            last_refill: now,
        }
    }

    pub(super) fn tokens(&self) -> f64 {
        self.tokens
    }

    pub(super) fn refill(&mut self, now: Instant, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).clamp(0.0, self.capacity);
        self.last_refill = now;
    }

    /// Takes one token if a whole one is available.
    pub(super) fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub(super) fn time_until_next_token(&self, rate: f64) -> Duration {
        if rate <= 0.0 {
            return FALLBACK_POLL_INTERVAL;
        }
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let millis = ((1.0 - self.tokens) / rate * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_full_and_drains() {
        let mut bucket = TokenBucket::new(2.0, Instant::now());
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_proportional_and_clamped() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, start);
        bucket.try_take();
        bucket.try_take();

        bucket.refill(start + Duration::from_millis(500), 1.0);
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);

        bucket.refill(start + Duration::from_secs(60), 1.0);
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_ignores_time_going_backwards() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, start + Duration::from_secs(1));
        bucket.try_take();
        bucket.refill(start, 10.0);
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_until_next_token() {
        let mut bucket = TokenBucket::new(2.0, Instant::now());
        assert_eq!(bucket.time_until_next_token(1.0), Duration::ZERO);

        bucket.try_take();
        bucket.try_take();
        assert_eq!(bucket.time_until_next_token(1.0), Duration::from_millis(1000));
        assert_eq!(bucket.time_until_next_token(0.1), Duration::from_millis(10_000));
        assert_eq!(bucket.time_until_next_token(3.0), Duration::from_millis(334));
        assert_eq!(bucket.time_until_next_token(0.0), FALLBACK_POLL_INTERVAL);
    }
}
