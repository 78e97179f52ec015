use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exponential growth with positive jitter, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(120),
            multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

/// Delay sequence for one job. Delays never decrease and never exceed `max`.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    base: Duration,
    last: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn seeded(policy: BackoffPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            base: policy.initial.min(policy.max),
            last: Duration::ZERO,
            policy,
            rng,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.policy.jitter > 0.0 {
            self.rng.gen_range(0.0..=self.policy.jitter)
        } else {
            0.0
        };
        let jittered = scaled(self.base, 1.0 + jitter, self.policy.max);
        let delay = jittered.max(self.last);

        self.last = delay;
        self.base = scaled(self.base, self.policy.multiplier.max(1.0), self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.base = self.policy.initial.min(self.policy.max);
        self.last = Duration::ZERO;
    }
}

/// `delay * factor`, saturating at `cap` rather than overflowing.
fn scaled(delay: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).map_or(cap, |d| d.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_monotonic_and_capped() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        };
        for seed in 0..20 {
            let mut b = Backoff::seeded(policy, seed);
            let delays: Vec<_> = (0..30).map(|_| b.next_delay()).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "seed {seed}: {delays:?}");
            assert!(delays.iter().all(|d| *d <= policy.max));
            assert!(delays[0] >= policy.initial);
            assert_eq!(*delays.last().unwrap(), policy.max);
        }
    }

    #[test]
    fn no_jitter_is_plain_exponential() {
        let mut b = Backoff::new(BackoffPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        });
        let secs: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 10, 10]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn extreme_policies_saturate_at_the_cap() {
        let mut b = Backoff::seeded(
            BackoffPolicy {
                initial: Duration::from_secs(u64::MAX / 2),
                max: Duration::MAX,
                multiplier: 1e300,
                jitter: 1.0,
            },
            7,
        );
        let delays: Vec<_> = (0..4).map(|_| b.next_delay()).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[3], Duration::MAX);
    }
}
