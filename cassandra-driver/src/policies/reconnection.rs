//! Reconnection policies produce the delays between attempts to reach a host
//! (or any host, for the control connection) after a failure.

use std::time::Duration;

/// A lazy, possibly infinite sequence of delays.
pub type ReconnectionSchedule = Box<dyn Iterator<Item = Duration> + Send + Sync>;

/// Produces a fresh schedule for each series of reconnection attempts.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    fn schedule(&self) -> ReconnectionSchedule;
}

/// Waits the same interval between all attempts.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    interval: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn schedule(&self) -> ReconnectionSchedule {
        Box::new(std::iter::repeat(self.interval))
    }
}

/// Starts at `start` and multiplies the delay by `exponent` after each attempt,
/// never exceeding `max`.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    start: Duration,
    max: Duration,
    exponent: f64,
}

impl ExponentialReconnectionPolicy {
    pub fn new(start: Duration, max: Duration) -> Self {
        Self {
            start,
            max,
            exponent: 2.0,
        }
    }

    pub fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn schedule(&self) -> ReconnectionSchedule {
        let max = self.max;
        let exponent = self.exponent;
        Box::new(std::iter::successors(Some(self.start.min(max)), move |interval| {
            let next = Duration::from_nanos((interval.as_nanos() as f64 * exponent) as u64);
            Some(next.min(max))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_schedule_grows_until_max() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );
        let delays: Vec<_> = policy.schedule().take(6).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1000, 1000].map(Duration::from_millis)
        );

        // Every schedule starts from the beginning.
        assert_eq!(policy.schedule().next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn exponential_schedule_with_custom_exponent() {
        let policy =
            ExponentialReconnectionPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
                .with_exponent(3.0);
        let delays: Vec<_> = policy.schedule().take(5).collect();
        assert_eq!(delays, [1, 3, 9, 27, 60].map(Duration::from_secs));
    }

    #[test]
    fn constant_schedule_repeats() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_secs(2));
        assert!(policy
            .schedule()
            .take(10)
            .all(|delay| delay == Duration::from_secs(2)));
    }
}
