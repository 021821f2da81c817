// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use backoff::{Clock, SystemClock};

use crate::config::BackoffConfig;
use crate::stats::StatsCollector;

/// Exponential backoff with jitter between failed attempts of one worker.
///
/// Idle until the first failure, then every [BackoffPolicy::next] hands out
/// the jittered current interval and grows it by the multiplier, up to the
/// max interval. Once the time since the last [BackoffPolicy::reset] exceeds
/// the max elapsed time, `next` returns `None` and the caller must give up.
pub struct BackoffPolicy<C = SystemClock> {
    inner: ExponentialBackoff<C>,
    stats: Arc<StatsCollector>,
    failures: u64,
}

impl BackoffPolicy<SystemClock> {
    pub fn new(config: &BackoffConfig, stats: Arc<StatsCollector>) -> Self {
        Self::with_clock(config, stats, SystemClock::default())
    }
}

impl<C: Clock> BackoffPolicy<C> {
    pub fn with_clock(config: &BackoffConfig, stats: Arc<StatsCollector>, clock: C) -> Self {
        let mut inner = ExponentialBackoff {
            current_interval: config.initial_interval,
            initial_interval: config.initial_interval,
            randomization_factor: config.randomization_factor,
            multiplier: config.multiplier,
            max_interval: config.max_interval,
            max_elapsed_time: Some(config.max_elapsed_time),
            start_time: Instant::now(),
            clock,
        };
        inner.reset();
        Self {
            inner,
            stats,
            failures: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retrying has gone on for
    /// longer than the max elapsed time.
    pub fn next(&mut self) -> Option<Duration> {
        if self.failures == 0 {
            // First failure since the last success: the elapsed budget starts now.
            self.inner.reset();
        }
        self.failures += 1;
        let delay = self.inner.next_backoff()?;
        self.stats.observe_backoff(delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        if self.failures > 0 {
            self.failures = 0;
            self.inner.reset();
        }
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn current_interval(&self) -> Duration {
        self.inner.current_interval
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.get_elapsed_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use prometheus::Registry;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<Instant>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Arc::new(Mutex::new(Instant::now())))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock()
        }
    }

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial_interval: Duration::from_millis(10),
            randomization_factor: 0.0,
            multiplier: 1.5,
            max_interval: Duration::from_millis(40),
            max_elapsed_time: Duration::from_secs(1),
        }
    }

    fn stats() -> Arc<StatsCollector> {
        Arc::new(StatsCollector::new(&Registry::new()).unwrap())
    }

    #[test]
    fn grows_geometrically_up_to_the_cap() {
        let stats = stats();
        let mut policy = BackoffPolicy::with_clock(&config(), stats.clone(), ManualClock::new());
        let delays: Vec<u128> = (0..6)
            .map(|_| policy.next().unwrap().as_micros())
            .collect();
        assert_eq!(delays, vec![10_000, 15_000, 22_500, 33_750, 40_000, 40_000]);
        assert_eq!(stats.backoff_delay().get_sample_count(), 6);
    }

    #[test]
    fn jitter_stays_within_the_randomization_factor() {
        let config = BackoffConfig {
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Duration::from_secs(100),
            ..config()
        };
        let mut policy = BackoffPolicy::with_clock(&config, stats(), ManualClock::new());
        let mut expected = 10_000.0;
        for _ in 0..5 {
            let delay = policy.next().unwrap().as_micros() as f64;
            assert!(delay >= expected * 0.5 - 1.0 && delay <= expected * 1.5 + 1.0);
            expected *= 1.5;
        }
    }

    #[test]
    fn warmup_delays_are_not_recorded() {
        let stats = stats();
        stats.set_recording(false);
        let mut policy = BackoffPolicy::with_clock(&config(), stats.clone(), ManualClock::new());
        assert!(policy.next().is_some());
        assert_eq!(stats.backoff_delay().get_sample_count(), 0);

        stats.set_recording(true);
        assert!(policy.next().is_some());
        assert_eq!(stats.backoff_delay().get_sample_count(), 1);
    }

    #[test]
    fn stops_after_max_elapsed_time() {
        let clock = ManualClock::new();
        let mut policy = BackoffPolicy::with_clock(&config(), stats(), clock.clone());
        assert!(policy.next().is_some());
        clock.advance(Duration::from_millis(500));
        assert!(policy.next().is_some());
        clock.advance(Duration::from_millis(600));
        assert_eq!(policy.next(), None);
        assert_eq!(policy.failures(), 3);
    }

    #[test]
    fn reset_restores_initial_interval_and_budget() {
        let clock = ManualClock::new();
        let mut policy = BackoffPolicy::with_clock(&config(), stats(), clock.clone());
        policy.next();
        policy.next();
        assert_eq!(policy.current_interval(), Duration::from_micros(22_500));

        clock.advance(Duration::from_secs(5));
        policy.reset();
        assert_eq!(policy.current_interval(), Duration::from_millis(10));
        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.next().map(|d| d.as_micros()), Some(10_000));
    }
}
