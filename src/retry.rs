//! Pure timer arithmetic for the retransmission schedule.
//!
//! An MRC/MRD-bounded schedule: doubling (RFC 5080 behavior) capped at
//! `max_rt`, jitter bound of exactly ±10%, and two distinct exhaustion
//! reasons (count vs. duration) instead of one "give up" state.

use std::time::{Duration, Instant};

use crate::config::RetryPolicy;
use crate::error::RetryExhaustion;

/// Outcome of advancing a [`RetryState`] to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Continue,
    Exhausted(RetryExhaustion),
}

/// {start, updated, next_fire, rt, count, config}.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    pub start: Instant,
    pub updated: Instant,
    pub next_fire: Instant,
    pub rt: Duration,
    pub count: u32,
    pub config: RetryPolicy,
}

impl RetryState {
    /// Resets state with `rt = initial_rt`, `count = 1`, `start = updated = now`.
    pub fn initial(config: RetryPolicy, now: Instant) -> Self {
        Self {
            start: now,
            updated: now,
            next_fire: now + config.initial_rt,
            rt: config.initial_rt,
            count: 1,
            config,
        }
    }

    /// Advances the schedule. On `Continue`, doubles `rt` (capped at
    /// `max_rt`), applies jitter in `[-0.1*rt, +0.1*rt]`, sets
    /// `next_fire = now + rt`, and increments `count`.
    ///
    /// MRC fires when the *next* `count` would exceed `mrc`; MRD fires when
    /// `now - start > mrd`. MRD is checked first since a request that has run
    /// out of time should not be told "one more try" by the count check.
    pub fn next(&mut self, now: Instant) -> RetryOutcome {
        if now.saturating_duration_since(self.start) > self.config.mrd {
            return RetryOutcome::Exhausted(RetryExhaustion::MaxRetransmitDuration);
        }
        if self.count + 1 > self.config.mrc {
            return RetryOutcome::Exhausted(RetryExhaustion::MaxRetransmitCount);
        }

        let doubled = self.rt.saturating_mul(2);
        let capped = doubled.min(self.config.max_rt);
        self.rt = jittered(capped);
        self.next_fire = now + self.rt;
        self.count += 1;
        self.updated = now;
        RetryOutcome::Continue
    }
}

/// Applies uniform jitter in `[-10%, +10%]` of `interval`.
fn jittered(interval: Duration) -> Duration {
    let base = interval.as_secs_f64();
    let jitter_range = base * 0.1;
    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
    let adjusted = (base + jitter).max(0.0);
    Duration::from_secs_f64(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_rt: Duration::from_millis(500),
            max_rt: Duration::from_millis(4000),
            mrc: 3,
            mrd: Duration::from_secs(30),
        }
    }

    #[test]
    fn counter_monotonically_increases() {
        let now = Instant::now();
        let mut state = RetryState::initial(policy(), now);
        assert_eq!(state.count, 1);
        assert_eq!(state.next(now + Duration::from_millis(500)), RetryOutcome::Continue);
        assert_eq!(state.count, 2);
    }

    #[test]
    fn mrc_exceeded_after_configured_attempts() {
        let now = Instant::now();
        let mut state = RetryState::initial(policy(), now);
        // mrc = 3: count starts at 1, two more `next()` calls reach count=3,
        // the third exceeds it.
        assert_eq!(state.next(now), RetryOutcome::Continue);
        assert_eq!(state.next(now), RetryOutcome::Continue);
        assert_eq!(
            state.next(now),
            RetryOutcome::Exhausted(RetryExhaustion::MaxRetransmitCount)
        );
    }

    #[test]
    fn mrd_exceeded_regardless_of_count() {
        let now = Instant::now();
        let mut state = RetryState::initial(policy(), now);
        let later = now + Duration::from_secs(31);
        assert_eq!(
            state.next(later),
            RetryOutcome::Exhausted(RetryExhaustion::MaxRetransmitDuration)
        );
    }

    #[test]
    fn interval_stays_within_bounds_with_jitter() {
        let now = Instant::now();
        let mut state = RetryState::initial(policy(), now);
        for _ in 0..2 {
            if state.next(now) != RetryOutcome::Continue {
                break;
            }
            let lower = state.config.initial_rt.mul_f64(0.9);
            let upper = state.config.max_rt.mul_f64(1.1);
            assert!(state.rt >= lower && state.rt <= upper);
        }
    }

    #[test]
    fn rt_caps_at_max_rt_before_jitter() {
        let cfg = RetryPolicy {
            initial_rt: Duration::from_millis(100),
            max_rt: Duration::from_millis(150),
            mrc: 10,
            mrd: Duration::from_secs(30),
        };
        let now = Instant::now();
        let mut state = RetryState::initial(cfg, now);
        state.next(now);
        // doubled (200ms) clamps to max_rt (150ms) before jitter is applied.
        assert!(state.rt <= cfg.max_rt.mul_f64(1.1));
    }
}
