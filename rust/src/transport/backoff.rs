use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Consecutive failures before the circuit opens. Zero disables the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            breaker_threshold: 8,
            breaker_cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStep {
    Retry { attempt: u32, delay: Duration },
    /// Too many failures in a row: wait out the cooldown, then probe once.
    CircuitOpen { failures: u32, cooldown: Duration },
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record one failure (a drop or a failed attempt) and decide the wait.
    pub fn next_step(&mut self) -> ReconnectStep {
        self.failures = self.failures.saturating_add(1);
        let threshold = self.policy.breaker_threshold;
        if threshold > 0 && self.failures >= threshold {
            return ReconnectStep::CircuitOpen {
                failures: self.failures,
                cooldown: self.policy.breaker_cooldown,
            };
        }
        let factor = self
            .policy
            .multiplier
            .max(1)
            .saturating_pow(self.failures - 1);
        let delay = self
            .policy
            .initial_delay
            .saturating_mul(factor)
            .min(self.policy.max_delay);
        ReconnectStep::Retry {
            attempt: self.failures,
            delay,
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delays(backoff: &mut Backoff, n: usize) -> Vec<u64> {
        (0..n)
            .map(|_| match backoff.next_step() {
                ReconnectStep::Retry { delay, .. } => delay.as_secs(),
                ReconnectStep::CircuitOpen { .. } => 0,
            })
            .collect()
    }

    #[test]
    fn first_retry_uses_the_fixed_delay_then_doubles_to_the_ceiling() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            breaker_threshold: 0,
            ..ReconnectPolicy::default()
        });
        assert_eq!(delays(&mut backoff, 7), vec![3, 6, 12, 24, 48, 60, 60]);
    }

    #[test]
    fn breaker_opens_after_threshold_and_stays_open_until_reset() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            breaker_threshold: 3,
            ..ReconnectPolicy::default()
        });
        assert!(matches!(backoff.next_step(), ReconnectStep::Retry { attempt: 1, .. }));
        assert!(matches!(backoff.next_step(), ReconnectStep::Retry { attempt: 2, .. }));
        assert_eq!(
            backoff.next_step(),
            ReconnectStep::CircuitOpen {
                failures: 3,
                cooldown: Duration::from_secs(120)
            }
        );
        // A failed half-open probe keeps the circuit open.
        assert!(matches!(backoff.next_step(), ReconnectStep::CircuitOpen { failures: 4, .. }));

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(
            backoff.next_step(),
            ReconnectStep::Retry {
                attempt: 1,
                delay: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            breaker_threshold: 0,
            ..ReconnectPolicy::default()
        });
        for _ in 0..200 {
            backoff.next_step();
        }
        assert!(matches!(
            backoff.next_step(),
            ReconnectStep::Retry { delay, .. } if delay == Duration::from_secs(60)
        ));
    }
}
