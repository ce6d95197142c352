//! Retry policies for failed attempts.
//!
//! A policy maps the number of attempts made so far to the instant the job
//! becomes claimable again, or `None` when the failure is final. Tasks carry
//! their own policy; the default is [`NoRetry`].

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Debug;

pub trait RetryPolicy: Send + Sync + Debug {
    /// `attempts` counts the attempt that just failed (1 after the first).
    fn next_retry(
        &self,
        attempts: u32,
        error: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

/// First failure is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_retry(&self, _: u32, _: &anyhow::Error, _: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}

/// Delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(TimeDelta),
    /// `step * attempts`.
    Linear(TimeDelta),
    /// `base * 2^(attempts - 1)`, capped at `max`.
    Exponential { base: TimeDelta, max: TimeDelta },
}

impl Backoff {
    /// `None` when the delay does not fit in a `TimeDelta`.
    pub fn delay(&self, attempts: u32) -> Option<TimeDelta> {
        match *self {
            Backoff::Fixed(delay) => Some(delay),
            Backoff::Linear(step) => step.checked_mul(i32::try_from(attempts).ok()?),
            Backoff::Exponential { base, max } => {
                let exponent = attempts.saturating_sub(1).min(30);
                Some(
                    base.checked_mul(1 << exponent)
                        .map_or(max, |delay| delay.min(max)),
                )
            }
        }
    }
}

/// Retry up to `max_attempts` total attempts, waiting per `backoff`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryStrategy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Retry immediately, up to `max_attempts` total attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::Fixed(TimeDelta::zero()))
    }
}

impl RetryPolicy for RetryStrategy {
    fn next_retry(
        &self,
        attempts: u32,
        _: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if attempts >= self.max_attempts {
            return None;
        }
        // An unrepresentable retry time is a final failure.
        now.checked_add_signed(self.backoff.delay(attempts)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err() -> anyhow::Error {
        anyhow::anyhow!("boom")
    }

    #[test]
    fn no_retry_never_reschedules() {
        assert_eq!(NoRetry.next_retry(1, &err(), Utc::now()), None);
    }

    #[test]
    fn strategy_stops_at_max_attempts() {
        let strategy = RetryStrategy::new(3, Backoff::Fixed(TimeDelta::seconds(10)));
        let now = Utc::now();
        assert_eq!(
            strategy.next_retry(1, &err(), now),
            Some(now + TimeDelta::seconds(10))
        );
        assert!(strategy.next_retry(2, &err(), now).is_some());
        assert_eq!(strategy.next_retry(3, &err(), now), None);
    }

    #[test]
    fn linear_backoff_grows_with_attempts() {
        let backoff = Backoff::Linear(TimeDelta::seconds(5));
        assert_eq!(backoff.delay(1), Some(TimeDelta::seconds(5)));
        assert_eq!(backoff.delay(3), Some(TimeDelta::seconds(15)));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: TimeDelta::seconds(2),
            max: TimeDelta::seconds(60),
        };
        assert_eq!(backoff.delay(1), Some(TimeDelta::seconds(2)));
        assert_eq!(backoff.delay(2), Some(TimeDelta::seconds(4)));
        assert_eq!(backoff.delay(4), Some(TimeDelta::seconds(16)));
        assert_eq!(backoff.delay(10), Some(TimeDelta::seconds(60)));
        assert_eq!(backoff.delay(500), Some(TimeDelta::seconds(60)));
    }

    #[test]
    fn overflowing_retry_time_is_final() {
        let now = Utc::now();

        let fixed = RetryStrategy::new(3, Backoff::Fixed(TimeDelta::MAX));
        assert_eq!(fixed.next_retry(1, &err(), now), None);

        let linear = RetryStrategy::new(u32::MAX, Backoff::Linear(TimeDelta::MAX / 2));
        assert_eq!(linear.next_retry(3, &err(), now), None);
        assert_eq!(Backoff::Linear(TimeDelta::seconds(1)).delay(u32::MAX), None);
    }
}
