//! Client-side timestamps attached to statements that do not carry one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::{Duration, Instant};
use tracing::warn;

/// Trait used to represent a timestamp generator
pub trait TimestampGenerator: Send + Sync {
    /// Microseconds since the UNIX epoch.
    fn next_timestamp(&self) -> i64;
}

fn now_micros() -> Option<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|since_epoch| since_epoch.as_micros() as i64)
}

/// Basic timestamp generator, reading the wall clock. Provides no guarantees;
/// a clock set before the UNIX epoch yields 0.
#[derive(Default, Debug)]
pub struct SimpleTimestampGenerator {}

impl SimpleTimestampGenerator {
    pub fn new() -> Self {
        SimpleTimestampGenerator {}
    }
}

impl TimestampGenerator for SimpleTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        now_micros().unwrap_or(0)
    }
}

/// Warning configuration for MonotonicTimestampGenerator
struct MonotonicTimestampGeneratorWarningsCfg {
    warning_threshold: Duration,
    warning_interval: Duration,
}

/// Monotonic timestamp generator. Guarantees monotonicity of timestamps.
/// If system clock will not provide an increased timestamp, then the timestamp will
/// be artificially increased. If the clock skew is bigger than
/// warning_threshold (by default 1 second), then the user will be warned about
/// the skew repeatedly, with warning_interval provided in the settings (by default 1 second).
/// Monotonicity only holds within one instance of this struct.
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
    last_warning: Mutex<Option<Instant>>,
    config: Option<MonotonicTimestampGeneratorWarningsCfg>,
}

impl MonotonicTimestampGenerator {
    /// Creates a new monotonic timestamp generator with default settings
    pub fn new() -> Self {
        MonotonicTimestampGenerator {
            last: AtomicI64::new(0),
            last_warning: Mutex::new(None),
            config: Some(MonotonicTimestampGeneratorWarningsCfg {
                warning_threshold: Duration::from_secs(1),
                warning_interval: Duration::from_secs(1),
            }),
        }
    }

    pub fn with_warning_times(
        mut self,
        warning_threshold: Duration,
        warning_interval: Duration,
    ) -> Self {
        self.config = Some(MonotonicTimestampGeneratorWarningsCfg {
            warning_threshold,
            warning_interval,
        });
        self
    }

    pub fn without_warnings(mut self) -> Self {
        self.config = None;
        self
    }

    // Always greater than `last`. When the clock lags behind, `last` is incremented.
    fn compute_next(&self, last: i64) -> i64 {
        let Some(current) = now_micros() else {
            warn!("Clock skew detected. The current time was behind UNIX epoch.");
            return last + 1;
        };
        if current > last {
            return current;
        }

        if let Some(cfg) = self.config.as_ref() {
            let skew = last - current;
            if skew > cfg.warning_threshold.as_micros() as i64 {
                let mut last_warning = self
                    .last_warning
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                let warned_recently = last_warning
                    .is_some_and(|warned_at| now < warned_at + cfg.warning_interval);
                if !warned_recently {
                    *last_warning = Some(now);
                    drop(last_warning);
                    warn!(
                        "Clock skew detected. The current time ({}) was {} \
                        microseconds behind the last generated timestamp ({}). \
                        The next generated timestamp will be artificially incremented \
                        to guarantee monotonicity.",
                        current, skew, last
                    )
                }
            }
        }

        last + 1
    }
}

impl Default for MonotonicTimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MonotonicTimestampGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicTimestampGenerator")
            .field("last", &self.last)
            .field("warnings", &self.config.is_some())
            .finish()
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next_timestamp(&self) -> i64 {
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let cur = self.compute_next(last);
            if self
                .last
                .compare_exchange(last, cur, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return cur;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn simple_timestamp_generator_reads_wall_clock() {
        let before = now_micros().unwrap();
        let generated = SimpleTimestampGenerator::new().next_timestamp();
        assert!(generated >= before);
    }

    #[test]
    fn monotonic_timestamp_generator_is_monotonic() {
        const NUMBER_OF_ITERATIONS: u32 = 1000;

        let generator = MonotonicTimestampGenerator::new();
        let mut prev = generator.next_timestamp();
        for _ in 0..NUMBER_OF_ITERATIONS {
            let cur = generator.next_timestamp();
            assert!(cur > prev);
            prev = cur;
        }
    }

    #[test]
    fn monotonic_timestamp_generator_overtakes_lagging_clock() {
        let generator = MonotonicTimestampGenerator::new().without_warnings();
        let future = now_micros().unwrap() + 60_000_000;
        generator.last.store(future, Ordering::SeqCst);
        assert_eq!(generator.next_timestamp(), future + 1);
        assert_eq!(generator.next_timestamp(), future + 2);
    }

    #[test]
    fn monotonic_timestamp_generator_is_monotonic_with_concurrency() {
        const NUMBER_OF_ITERATIONS: usize = 1000;
        const NUMBER_OF_THREADS: usize = 10;
        let generator = Arc::new(MonotonicTimestampGenerator::new());
        let timestamps_sets: Vec<_> = std::thread::scope(|s| {
            (0..NUMBER_OF_THREADS)
                .map(|_| {
                    s.spawn(|| {
                        let timestamps: Vec<i64> = (0..NUMBER_OF_ITERATIONS)
                            .map(|_| generator.next_timestamp())
                            .collect();
                        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
                        HashSet::<i64>::from_iter(timestamps)
                    })
                })
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let full_set: HashSet<i64> = timestamps_sets.iter().flatten().copied().collect();
        assert_eq!(
            full_set.len(),
            NUMBER_OF_ITERATIONS * NUMBER_OF_THREADS,
            "Colliding values between threads"
        );
    }
}
