use crate::config::PulseConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Outcome of one reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Bounded reconnect schedule with exponential backoff and a cooldown once exhausted.
///
/// * Each consecutive failure doubles the wait before the next attempt, from `base_delay` up
///   to `max_delay`.
/// * After `max_attempts` consecutive failures the policy is exhausted and
///   [`ReconnectPolicy::should_retry`] stays `false` for `cooldown`, after which the counter
///   resets and a fresh cycle of attempts is allowed.
/// * A single success resets the counter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    cooldown: Duration,
    attempts: u32,
    next_attempt_at: Option<Instant>,
    exhausted_at: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            cooldown,
            attempts: 0,
            next_attempt_at: None,
            exhausted_at: None,
        }
    }

    pub fn from_config(config: &PulseConfig) -> Self {
        Self::new(
            config.max_reconnect_attempts,
            config.reconnect_delay,
            config.max_reconnect_delay,
            config.reconnect_cooldown,
        )
    }

    /// Whether a reconnect attempt may be made at `now`.
    ///
    /// Once the cooldown of an exhausted policy has elapsed this resets the attempt counter.
    pub fn should_retry(&mut self, now: Instant) -> bool {
        if let Some(exhausted_at) = self.exhausted_at {
            if now.saturating_duration_since(exhausted_at) < self.cooldown {
                return false;
            }
            info!(
                cooldown_secs = self.cooldown.as_secs(),
                "reconnect cooldown elapsed, allowing a new reconnect cycle"
            );
            self.reset();
        }

        self.next_attempt_at.is_none_or(|at| now >= at)
    }

    pub fn record_attempt(&mut self, outcome: AttemptOutcome, now: Instant) {
        match outcome {
            AttemptOutcome::Success => self.reset(),
            AttemptOutcome::Failure => {
                self.attempts = self.attempts.saturating_add(1);
                if self.attempts >= self.max_attempts {
                    self.exhausted_at = Some(now);
                    self.next_attempt_at = None;
                } else {
                    self.next_attempt_at = Some(now + self.backoff(self.attempts));
                }
            }
        }
    }

    /// Wait after the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
        self.exhausted_at = None;
    }

    /// Consecutive failed attempts in the current cycle.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted_at.is_some()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
