//! Reconnect delay schedule.
//!
//! Wraps a `backon` exponential backoff built from a [`ReconnectPolicy`] and
//! spreads each delay with jitter so that every connection of a cluster does
//! not reconnect in lockstep after a failover.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;

use crate::config::ReconnectPolicy;

/// Stateful iterator over reconnect delays.
#[derive(Debug)]
pub(crate) struct ReconnectSchedule {
    policy: ReconnectPolicy,
    backoff: ExponentialBackoff,
    attempt: u32,
}

impl ReconnectSchedule {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        let backoff = build_backoff(&policy);
        Self { policy, backoff, attempt: 0 }
    }

    /// Returns the next attempt number and its delay, or `None` once the
    /// policy's attempts are used up.
    pub(crate) fn next_delay(&mut self) -> Option<(u32, Duration)> {
        let delay = self.backoff.next()?;
        self.attempt = self.attempt.saturating_add(1);
        Some((self.attempt, apply_jitter(delay, self.policy.jitter)))
    }

    /// Attempts made since the last reset.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Starts over from the initial delay after a successful bind.
    pub(crate) fn reset(&mut self) {
        self.backoff = build_backoff(&self.policy);
        self.attempt = 0;
    }
}

fn build_backoff(policy: &ReconnectPolicy) -> ExponentialBackoff {
    let max_times = policy.max_attempts.map_or(usize::MAX, |n| n as usize);
    ExponentialBuilder::default()
        .with_min_delay(policy.initial_delay)
        .with_max_delay(policy.max_delay)
        .with_factor(policy.factor as f32)
        .with_max_times(max_times)
        .build()
}

/// Applies ±`factor` jitter to a duration.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}
