use std::time::Duration;

use rand::Rng;

use crate::config::LockTimeoutConfig;
use crate::opcodes::{OP_PRIO_HIGHEST, OP_PRIO_LOWEST};

/// Random variation applied to every attempt window (±5%).
const JITTER: f64 = 0.05;

/// Successive lock attempt windows for one opcode.
///
/// Windows grow as `t' = (t * 1.05) ^ 1.25` seconds, clamped to the configured
/// minimum and maximum, until their sum reaches the configured total. Windows
/// are scaled by priority: highest-priority opcodes use half the base window,
/// lowest-priority ones one and a half.
#[derive(Debug, Clone)]
pub struct LockAttemptTimeoutStrategy {
    timeouts: Vec<f64>,
    next: usize,
    scale: f64,
}

impl LockAttemptTimeoutStrategy {
    pub fn new(config: &LockTimeoutConfig, priority: i32) -> Self {
        Self {
            timeouts: attempt_timeouts(config),
            next: 0,
            scale: priority_scale(priority),
        }
    }

    /// Window for the next attempt, or `None` once the attempts are used up.
    pub fn next_attempt(&mut self) -> Option<Duration> {
        let base = *self.timeouts.get(self.next)?;
        self.next += 1;
        let variation = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        Some(Duration::from_secs_f64(base * self.scale * variation))
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.timeouts.len()
    }

    pub fn attempts(&self) -> usize {
        self.timeouts.len()
    }
}

fn priority_scale(priority: i32) -> f64 {
    let prio = priority.clamp(OP_PRIO_HIGHEST, OP_PRIO_LOWEST);
    let span = f64::from(OP_PRIO_LOWEST - OP_PRIO_HIGHEST);
    0.5 + f64::from(prio - OP_PRIO_HIGHEST) / span
}

fn attempt_timeouts(config: &LockTimeoutConfig) -> Vec<f64> {
    let min = config.min_wait_ms as f64 / 1000.0;
    let max = (config.max_wait_ms as f64 / 1000.0).max(min);
    let total = config.total_ms as f64 / 1000.0;

    let mut timeouts = vec![min];
    let mut sum = min;
    while sum < total && min > 0.0 {
        let prev = timeouts[timeouts.len() - 1];
        let next = (prev * 1.05).powf(1.25).clamp(min, max);
        timeouts.push(next);
        sum += next;
    }
    timeouts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> LockTimeoutConfig {
        LockTimeoutConfig {
            min_wait_ms: 1_000,
            max_wait_ms: 15_000,
            total_ms: 60_000,
            blocking_cap_ms: 120_000,
        }
    }

    #[test]
    fn windows_grow_and_stay_within_bounds() {
        let timeouts = attempt_timeouts(&LockTimeoutConfig::default());
        assert_eq!(timeouts[0], 1.0);
        assert!(timeouts.windows(2).all(|w| w[1] >= w[0]));
        assert!(timeouts.iter().all(|t| (1.0..=15.0).contains(t)));
        assert_eq!(*timeouts.last().unwrap(), 15.0);
        let sum: f64 = timeouts.iter().sum();
        assert!(sum >= 1800.0);
        assert!(sum < 1800.0 + 15.0);
    }

    #[test]
    fn strategy_is_exhausted_after_all_attempts() {
        let cfg = small_config();
        let mut strategy = LockAttemptTimeoutStrategy::new(&cfg, 0);
        let attempts = strategy.attempts();
        for _ in 0..attempts {
            assert!(strategy.next_attempt().is_some());
        }
        assert!(strategy.is_exhausted());
        assert!(strategy.next_attempt().is_none());
    }

    #[test]
    fn first_window_is_jittered_around_minimum() {
        let cfg = small_config();
        // Priority 0 scales by roughly one.
        let scale = priority_scale(0);
        for _ in 0..20 {
            let mut strategy = LockAttemptTimeoutStrategy::new(&cfg, 0);
            let first = strategy.next_attempt().unwrap().as_secs_f64();
            assert!(first >= 0.95 * scale - 1e-9 && first <= 1.05 * scale + 1e-9);
        }
    }

    #[test]
    fn higher_priority_uses_shorter_windows() {
        assert_eq!(priority_scale(OP_PRIO_HIGHEST), 0.5);
        assert_eq!(priority_scale(OP_PRIO_LOWEST), 1.5);
        assert!(priority_scale(-10) < priority_scale(0));
        assert!(priority_scale(0) < priority_scale(10));
    }
}
