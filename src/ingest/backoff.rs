//! Reconnect pacing for broker connections.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::config::ReconnectConfig;

/// Longest uninterrupted sleep while waiting; bounds stop latency.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Exponential backoff with equal jitter.
///
/// The ceiling starts at `initial`, grows by `multiplier_pct` per consecutive
/// failure, and is capped at `max`. Each delay is half the ceiling plus a
/// uniformly random share of the other half. A successful connect resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier_pct: u32,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, multiplier_pct: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier_pct: multiplier_pct.max(100),
            attempt: 0,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.initial_backoff_ms),
            Duration::from_millis(cfg.max_backoff_ms),
            cfg.multiplier_pct,
        )
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay.
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        let mut ceiling = self.initial;
        for _ in 0..self.attempt {
            ceiling = ceiling
                .checked_mul(self.multiplier_pct)
                .map_or(self.max, |grown| grown / 100)
                .min(self.max);
            if ceiling == self.max {
                break;
            }
        }
        ceiling
    }

    /// Delay before the next connection attempt; advances the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let spread = u64::try_from((ceiling - half).as_millis()).unwrap_or(u64::MAX);
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleep for `duration` unless `stop` is raised first.
///
/// Returns `true` when the full duration elapsed, `false` when stopped early.
pub fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
