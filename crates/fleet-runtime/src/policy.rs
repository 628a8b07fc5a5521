//! # Restart and Health Policies
//!
//! Pure decision logic used by the supervisor. Nothing here sleeps, spawns
//! or touches lifecycle state.
//!
//! - [`BackoffPolicy`]: delay before relaunch attempt `n` is
//!   `first × factor^(n-1)`, clamped to `max`. With `factor >= 1` it never
//!   decreases.
//! - [`decide_restart`]: what to do after a crash given the restart policy
//!   and how many restarts already happened.
//! - [`HealthTracker`]: consecutive-failure counting against a threshold.

use std::time::Duration;

use fleet_types::RestartPolicy;

/// Growth of the restart delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first relaunch.
    pub first: Duration,
    /// Multiplicative growth factor (>= 1.0).
    pub factor: f64,
    /// Cap.
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(first: Duration, factor: f64, max: Duration) -> Self {
        Self {
            first,
            factor: factor.max(1.0),
            max,
        }
    }

    /// Delay before relaunch `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let max = self.max.max(self.first);
        if !secs.is_finite() || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Outcome of a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after `delay`. `attempt` is the new restart count.
    Restart {
        attempt: u32,
        delay: Duration,
        /// `always` past `max_restarts`; logged, never enforced.
        over_budget: bool,
    },
    /// Move to `Failed`.
    GiveUp { restarts: u32 },
}

/// Decide what happens after a crash.
///
/// `restarts` is the number of relaunches already performed.
pub fn decide_restart(
    policy: RestartPolicy,
    restarts: u32,
    max_restarts: u32,
    backoff: &BackoffPolicy,
) -> RestartDecision {
    let attempt = restarts.saturating_add(1);
    match policy {
        RestartPolicy::Never => RestartDecision::GiveUp { restarts },
        RestartPolicy::OnFailure if restarts >= max_restarts => {
            RestartDecision::GiveUp { restarts }
        }
        RestartPolicy::OnFailure => RestartDecision::Restart {
            attempt,
            delay: backoff.delay(attempt),
            over_budget: false,
        },
        RestartPolicy::Always => RestartDecision::Restart {
            attempt,
            delay: backoff.delay(attempt),
            over_budget: restarts >= max_restarts,
        },
    }
}

/// Result of recording one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Probe passed; the failure streak was reset.
    Passed,
    /// Probe failed; `consecutive` is below the threshold.
    Degraded { consecutive: u32 },
    /// The threshold was reached.
    Unhealthy { consecutive: u32 },
}

/// Consecutive failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTracker {
    threshold: u32,
    consecutive: u32,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record(&mut self, healthy: bool) -> HealthVerdict {
        if healthy {
            self.consecutive = 0;
            return HealthVerdict::Passed;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            HealthVerdict::Unhealthy {
                consecutive: self.consecutive,
            }
        } else {
            HealthVerdict::Degraded {
                consecutive: self.consecutive,
            }
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(1))
    }

    #[test]
    fn test_first_attempt_uses_restart_delay() {
        assert_eq!(backoff().delay(1), Duration::from_millis(100));
        assert_eq!(backoff().delay(2), Duration::from_millis(200));
        assert_eq!(backoff().delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(backoff().delay(10), Duration::from_secs(1));
        assert_eq!(backoff().delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let policy = BackoffPolicy::new(Duration::from_millis(30), 1.7, Duration::from_secs(2));
        let delays: Vec<Duration> = (1..40).map(|n| policy.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_shrinking_factor_clamped() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 0.5, Duration::from_secs(1));
        assert_eq!(policy.delay(5), Duration::from_millis(100));
    }

    #[test]
    fn test_on_failure_gives_up_at_budget() {
        let b = backoff();
        assert!(matches!(
            decide_restart(RestartPolicy::OnFailure, 0, 2, &b),
            RestartDecision::Restart { attempt: 1, .. }
        ));
        assert!(matches!(
            decide_restart(RestartPolicy::OnFailure, 1, 2, &b),
            RestartDecision::Restart { attempt: 2, .. }
        ));
        assert_eq!(
            decide_restart(RestartPolicy::OnFailure, 2, 2, &b),
            RestartDecision::GiveUp { restarts: 2 }
        );
    }

    #[test]
    fn test_always_restarts_past_budget() {
        let decision = decide_restart(RestartPolicy::Always, 3, 2, &backoff());
        assert!(matches!(
            decision,
            RestartDecision::Restart {
                attempt: 4,
                over_budget: true,
                ..
            }
        ));
    }

    #[test]
    fn test_never_gives_up_immediately() {
        assert_eq!(
            decide_restart(RestartPolicy::Never, 0, 5, &backoff()),
            RestartDecision::GiveUp { restarts: 0 }
        );
    }

    #[test]
    fn test_threshold_three_consecutive() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.record(false), HealthVerdict::Degraded { consecutive: 1 });
        assert_eq!(tracker.record(false), HealthVerdict::Degraded { consecutive: 2 });
        assert_eq!(tracker.record(false), HealthVerdict::Unhealthy { consecutive: 3 });
    }

    #[test]
    fn test_success_resets_streak() {
        let mut tracker = HealthTracker::new(3);
        tracker.record(false);
        tracker.record(false);
        assert_eq!(tracker.record(true), HealthVerdict::Passed);
        assert_eq!(tracker.record(false), HealthVerdict::Degraded { consecutive: 1 });
        assert_eq!(tracker.consecutive(), 1);
    }
}
