//! Randomized exponential backoff for retry loops.
//!
//! [`ExponentialBackOff`] produces a sequence of delays that grows by
//! `multiplier` per attempt, is jittered by `randomization_factor`, and is
//! clamped at `max_interval`:
//!
//! ```text
//! next = current_interval * uniform(1 - r, 1 + r)
//! ```
//!
//! Once the total elapsed time would exceed `max_elapsed_time`, the policy
//! stops (returns `None`). A `max_elapsed_time` of zero means "never stop".
//!
//! Time is read and slept through the injected [`Clock`], so tests can run
//! a whole retry schedule instantaneously with [`MockClock`].
//!
//! Instances are not thread-safe by design; every retry loop owns its own.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

/// Time source used by the backoff policy.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// The real clock: `Instant::now` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock that only advances when slept on. Makes backoff tests
/// deterministic and instantaneous.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<Instant>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        *self.now.lock().unwrap() += duration;
        Box::pin(std::future::ready(()))
    }
}

/// Randomized exponential backoff state.
#[derive(Clone)]
pub struct ExponentialBackOff {
    pub initial_interval: Duration,
    /// Jitter as a fraction of the current interval, in `0.0..=1.0`.
    pub randomization_factor: f64,
    /// Growth per attempt, `>= 1.0`.
    pub multiplier: f64,
    /// Cap on `current_interval` (not on the randomized result).
    pub max_interval: Duration,
    /// Total budget before the policy stops. Zero means unlimited.
    pub max_elapsed_time: Duration,

    pub current_interval: Duration,
    pub start_time: Instant,

    pub clock: Arc<dyn Clock>,
}

impl Default for ExponentialBackOff {
    fn default() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut b = Self {
            initial_interval: Duration::from_millis(500),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed_time: Duration::from_secs(15 * 60),
            current_interval: Duration::ZERO,
            start_time: clock.now(),
            clock,
        };
        b.reset();
        b
    }
}

impl std::fmt::Debug for ExponentialBackOff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackOff")
            .field("initial_interval", &self.initial_interval)
            .field("randomization_factor", &self.randomization_factor)
            .field("multiplier", &self.multiplier)
            .field("max_interval", &self.max_interval)
            .field("max_elapsed_time", &self.max_elapsed_time)
            .field("current_interval", &self.current_interval)
            .finish_non_exhaustive()
    }
}

impl ExponentialBackOff {
    /// Reset the interval to `initial_interval` and restart the elapsed
    /// timer.
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start_time = self.clock.now();
    }

    /// Time elapsed since construction or the last [`reset`](Self::reset).
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start_time)
    }

    /// Compute the next backoff delay, or `None` once the elapsed-time
    /// budget is exhausted.
    pub fn next_back_off(&mut self) -> Option<Duration> {
        let elapsed = self.elapsed();
        let next = randomized_interval(self.randomization_factor, self.current_interval);
        self.increment_current_interval();

        if !self.max_elapsed_time.is_zero() && elapsed + next > self.max_elapsed_time {
            return None;
        }

        Some(next)
    }

    // Multiply the interval, clamping at max_interval (also guards the
    // float multiplication against overflow).
    fn increment_current_interval(&mut self) {
        let current = self.current_interval.as_secs_f64();
        let max = self.max_interval.as_secs_f64();

        if current >= max / self.multiplier {
            self.current_interval = self.max_interval;
        } else {
            self.current_interval = Duration::from_secs_f64(current * self.multiplier);
        }
    }
}

fn randomized_interval(factor: f64, interval: Duration) -> Duration {
    if factor <= 0.0 {
        return interval;
    }

    let delta = factor * interval.as_secs_f64();
    let min = interval.as_secs_f64() - delta;
    let max = interval.as_secs_f64() + delta;

    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}

/// A lazy retry sequence driven by a backoff policy.
///
/// Yields `(attempt_index, elapsed)` pairs, sleeping the next backoff delay
/// between yields and ending once the policy stops:
///
/// ```ignore
/// let mut attempts = retry(&mut backoff);
/// while let Some((attempt, elapsed)) = attempts.next().await {
///     // try the operation; break on success
/// }
/// ```
pub struct Retry<'a> {
    backoff: &'a mut ExponentialBackOff,
    attempt: u64,
}

/// Start a retry sequence. Resets the policy first.
pub fn retry(backoff: &mut ExponentialBackOff) -> Retry<'_> {
    backoff.reset();

    Retry {
        backoff,
        attempt: 0,
    }
}

impl Retry<'_> {
    /// Yield the next attempt, sleeping the backoff delay first (the
    /// initial attempt is immediate). Returns `None` once the policy
    /// stops. The sleep is cooperative: dropping the future cancels it.
    pub async fn next(&mut self) -> Option<(u64, Duration)> {
        if self.attempt > 0 {
            let delay = self.backoff.next_back_off()?;
            let clock = Arc::clone(&self.backoff.clock);
            clock.sleep(delay).await;
        }

        let attempt = self.attempt;
        self.attempt += 1;

        Some((attempt, self.backoff.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_backoff(clock: Arc<dyn Clock>) -> ExponentialBackOff {
        let mut b = ExponentialBackOff {
            initial_interval: Duration::from_millis(100),
            randomization_factor: 0.1,
            multiplier: 3.0,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Duration::from_secs(25),
            current_interval: Duration::ZERO,
            start_time: clock.now(),
            clock,
        };
        b.reset();
        b
    }

    const EXPECTED_INTERVALS: [Duration; 9] = [
        Duration::from_millis(100),
        Duration::from_millis(300),
        Duration::from_millis(900),
        Duration::from_millis(2700),
        Duration::from_millis(8100),
        Duration::from_millis(10000),
        Duration::from_millis(10000),
        Duration::from_millis(10000),
        Duration::from_millis(10000),
    ];

    #[test]
    fn produces_exponentially_increasing_intervals() {
        let mut b = test_backoff(Arc::new(MockClock::default()));

        for expected in EXPECTED_INTERVALS {
            assert_eq!(b.current_interval, expected);

            // One nanosecond of slack for float rounding in the jitter.
            let jitter = expected.mul_f64(b.randomization_factor) + Duration::from_nanos(1);
            let actual = b.next_back_off().unwrap();

            assert!(actual >= expected - jitter, "{actual:?} < {expected:?} - jitter");
            assert!(actual <= expected + jitter, "{actual:?} > {expected:?} + jitter");
        }
    }

    #[test]
    fn interval_is_monotone_and_clamped() {
        let mut b = test_backoff(Arc::new(MockClock::default()));
        b.randomization_factor = 0.0;
        b.max_elapsed_time = Duration::ZERO;

        let mut previous = Duration::ZERO;
        for _ in 0..32 {
            let current = b.current_interval;
            assert!(current >= previous);
            assert!(current <= b.max_interval);
            previous = current;
            b.next_back_off().unwrap();
        }

        assert_eq!(b.current_interval, b.max_interval);
    }

    #[test]
    fn stops_after_max_elapsed_time() {
        let clock = Arc::new(MockClock::default());
        let mut b = test_backoff(clock.clone());

        // Only the clock moves time forward; simulate the retry loop's
        // sleeps by advancing it with each returned delay.
        let mut stopped = false;
        for _ in 0..64 {
            match b.next_back_off() {
                Some(delay) => drop(clock.sleep(delay)),
                None => {
                    stopped = true;
                    break;
                }
            }
        }

        assert!(stopped);
        assert!(b.elapsed() <= b.max_elapsed_time);
    }

    #[test]
    fn never_stops_with_zero_max_elapsed_time() {
        let clock = Arc::new(MockClock::default());
        let mut b = test_backoff(clock.clone());
        b.max_elapsed_time = Duration::ZERO;

        for _ in 0..128 {
            let delay = b.next_back_off().expect("must not stop");
            drop(clock.sleep(delay));
        }
    }

    #[tokio::test]
    async fn retry_yields_attempts_until_stop() {
        let clock = Arc::new(MockClock::default());
        let mut b = test_backoff(clock);

        let mut seen = Vec::new();
        let mut attempts = retry(&mut b);
        while let Some((attempt, _elapsed)) = attempts.next().await {
            seen.push(attempt);
            assert!(seen.len() < 64, "retry must stop");
        }

        // 25s budget over the 100ms/3x schedule: the first attempt is
        // immediate and the schedule passes 25s shortly after the sixth.
        assert_eq!(seen[0], 0);
        assert!(seen.len() >= 5);
        assert_eq!(seen, (0..seen.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn retry_can_be_broken_by_caller() {
        let mut b = ExponentialBackOff {
            clock: Arc::new(MockClock::default()),
            ..Default::default()
        };

        let mut attempts = retry(&mut b);
        while let Some((attempt, _)) = attempts.next().await {
            if attempt == 2 {
                break;
            }
        }
    }
}
