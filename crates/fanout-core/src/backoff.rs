use std::time::Duration;

/// Capped exponential backoff: `delay(attempt) = min(base * multiplier^attempt, max)`.
///
/// One policy type serves both call sites; they differ only in
/// constants (the shared broker retries faster than a direct per-tab
/// connection).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, multiplier: u32) -> Self {
        Self { base, max, multiplier }
    }

    /// Constants used by the shared broker.
    pub fn broker() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000), 2)
    }

    /// Constants used by a direct per-tab connection.
    pub fn direct() -> Self {
        Self::new(Duration::from_millis(3000), Duration::from_millis(30_000), 2)
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = (self.multiplier as u64)
            .checked_pow(attempt)
            .unwrap_or(u64::MAX);
        let ms = base_ms.saturating_mul(factor).min(max_ms);
        Duration::from_millis(ms)
    }
}

/// Mutable retry progress. Owned by whoever owns the connection: the
/// broker in shared mode, the tab in direct mode.
#[derive(Clone, Debug)]
pub struct BackoffState {
    policy: BackoffPolicy,
    attempt: u32,
}

impl BackoffState {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay for the next reconnect attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called on successful open. Counter returns to zero.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.policy.delay(self.attempt)
    }
}
