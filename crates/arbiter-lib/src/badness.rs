//! Badness scoring
//!
//! Badness is a bounded score per resource axis in [0, 100] that tracks how
//! long a user has been over their threshold. It rises while accounted usage
//! exceeds `threshold * quota` and decays toward zero otherwise, tuned so a
//! user pinned at their full quota reaches 100 after `time_to_max_bad`
//! seconds. A combined score of 100 is a violation.

use crate::config::BadnessConfig;

/// A user's badness at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Badness {
    /// CPU axis score in [0, 100].
    pub cpu: f64,
    /// Memory axis score in [0, 100].
    pub mem: f64,
    /// Epoch seconds of the last update.
    pub updated_ts: i64,
    /// Epoch seconds when the score last left zero; 0 while good.
    pub start_of_bad_ts: i64,
}

/// A (cpu, mem) pair of percentages, used for both usage and quotas.
#[derive(Debug, Clone, Copy)]
pub struct PerAxis {
    pub cpu: f64,
    pub mem: f64,
}

impl Badness {
    pub fn new(now: i64) -> Self {
        Self {
            cpu: 0.0,
            mem: 0.0,
            updated_ts: now,
            start_of_bad_ts: 0,
        }
    }

    /// Rebuild a badness from stored scores, e.g. when rehydrating from the
    /// status store at startup.
    pub fn from_scores(cpu: f64, mem: f64, updated_ts: i64) -> Self {
        let mut badness = Self {
            cpu: cpu.clamp(0.0, 100.0),
            mem: mem.clamp(0.0, 100.0),
            updated_ts,
            start_of_bad_ts: 0,
        };
        if badness.is_bad() {
            badness.start_of_bad_ts = updated_ts;
        }
        badness
    }

    /// Zero the score, e.g. on entry into a penalty status.
    pub fn reset(&mut self, now: i64) {
        self.cpu = 0.0;
        self.mem = 0.0;
        self.updated_ts = now;
        self.start_of_bad_ts = 0;
    }

    pub fn is_good(&self) -> bool {
        self.cpu == 0.0 && self.mem == 0.0
    }

    pub fn is_bad(&self) -> bool {
        !self.is_good()
    }

    /// The combined score, saturating at 100.
    pub fn score(&self) -> f64 {
        (self.cpu + self.mem).min(100.0)
    }

    /// Whether the score demands a penalty.
    pub fn is_violation(&self) -> bool {
        self.cpu + self.mem >= 100.0
    }

    /// Whether a stored score is too old to matter.
    pub fn expired(&self, timeout: i64, now: i64) -> bool {
        self.updated_ts + timeout < now
    }

    /// Apply one tick's worth of accounted usage against the user's quotas.
    /// `interval_secs` is the control cycle length (`arbiter_refresh`).
    pub fn update(
        &mut self,
        usage: PerAxis,
        quotas: PerAxis,
        policy: &BadnessConfig,
        interval_secs: u64,
        now: i64,
    ) {
        let was_bad = self.is_bad();
        let delta = delta_badness(usage, quotas, policy, interval_secs);
        self.cpu = (self.cpu + delta.cpu).clamp(0.0, 100.0);
        self.mem = (self.mem + delta.mem).clamp(0.0, 100.0);
        self.updated_ts = now;

        if was_bad && self.is_good() {
            self.start_of_bad_ts = 0;
        } else if !was_bad && self.is_bad() {
            self.start_of_bad_ts = now;
        }
    }
}

/// Compute one tick's change in badness for both axes.
pub fn delta_badness(
    usage: PerAxis,
    quotas: PerAxis,
    policy: &BadnessConfig,
    interval_secs: u64,
) -> PerAxis {
    PerAxis {
        cpu: axis_delta(
            usage.cpu,
            quotas.cpu,
            policy.cpu_badness_threshold,
            policy,
            interval_secs,
        ),
        mem: axis_delta(
            usage.mem,
            quotas.mem,
            policy.mem_badness_threshold,
            policy,
            interval_secs,
        ),
    }
}

fn axis_delta(
    usage: f64,
    quota: f64,
    threshold: f64,
    policy: &BadnessConfig,
    interval_secs: u64,
) -> f64 {
    // A nonpositive quota means unlimited; nothing can be over it.
    let rel_usage = if quota > 0.0 { usage / quota } else { 0.0 };
    let interval = interval_secs as f64;

    if rel_usage > threshold {
        let rate = 100.0 / (policy.time_to_max_bad as f64 * threshold);
        let mut change = (rel_usage - threshold) * rate * interval;
        if policy.cap_badness_incr {
            // Erroneous samples (e.g. a runaway CPU% from clock skew) must
            // not spike the score past the rate seen at 100% of quota.
            change = change.min((1.0 - threshold) * rate * interval);
        }
        change
    } else if rel_usage < threshold {
        let rate = 100.0 / policy.time_to_min_bad as f64;
        -((threshold - rel_usage) * rate * interval)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BadnessConfig {
        BadnessConfig {
            max_history_kept: 60,
            cpu_badness_threshold: 0.5,
            mem_badness_threshold: 0.5,
            time_to_max_bad: 900,
            time_to_min_bad: 900,
            cap_badness_incr: true,
            imported_badness_timeout: 3600,
        }
    }

    const QUOTAS: PerAxis = PerAxis {
        cpu: 400.0,
        mem: 50.0,
    };

    #[test]
    fn test_sustained_overuse_reaches_100_at_time_to_max_bad() {
        // A user pinned at their full CPU quota (400% of core, threshold
        // 0.5) should cross a score of 100 at t = 900s with a 5s refresh.
        let policy = policy();
        let mut badness = Badness::new(0);
        let usage = PerAxis {
            cpu: 400.0,
            mem: 0.0,
        };

        let mut ticks = 0;
        while !badness.is_violation() {
            ticks += 1;
            badness.update(usage, QUOTAS, &policy, 5, ticks * 5);
            assert!(ticks <= 181, "should have violated by 900s");
        }
        // One tick of slack for floating point accumulation
        let violated_at = ticks * 5;
        assert!((895..=905).contains(&violated_at), "violated at {}", violated_at);
    }

    #[test]
    fn test_usage_below_threshold_decays_to_zero() {
        let policy = policy();
        let mut badness = Badness::from_scores(60.0, 0.0, 0);
        let idle = PerAxis { cpu: 0.0, mem: 0.0 };

        for tick in 1..=200 {
            badness.update(idle, QUOTAS, &policy, 5, tick * 5);
        }
        assert!(badness.is_good());
        assert_eq!(badness.start_of_bad_ts, 0);
    }

    #[test]
    fn test_usage_at_threshold_is_neutral() {
        let policy = policy();
        let mut badness = Badness::from_scores(10.0, 10.0, 0);
        // Exactly threshold * quota on both axes
        let usage = PerAxis {
            cpu: 200.0,
            mem: 25.0,
        };
        badness.update(usage, QUOTAS, &policy, 5, 5);
        assert_eq!(badness.cpu, 10.0);
        assert_eq!(badness.mem, 10.0);
    }

    #[test]
    fn test_increase_capped_at_full_quota_rate() {
        let policy = policy();
        // 10x the quota; without the cap this would spike the score
        let runaway = PerAxis {
            cpu: 4000.0,
            mem: 0.0,
        };
        let capped = delta_badness(runaway, QUOTAS, &policy, 5);
        let at_quota = delta_badness(
            PerAxis {
                cpu: 400.0,
                mem: 0.0,
            },
            QUOTAS,
            &policy,
            5,
        );
        assert_eq!(capped.cpu, at_quota.cpu);

        let mut uncapped_policy = policy.clone();
        uncapped_policy.cap_badness_incr = false;
        let uncapped = delta_badness(runaway, QUOTAS, &uncapped_policy, 5);
        assert!(uncapped.cpu > capped.cpu);
    }

    #[test]
    fn test_unlimited_quota_never_accumulates() {
        let policy = policy();
        let unlimited = PerAxis {
            cpu: -1.0,
            mem: 50.0,
        };
        let usage = PerAxis {
            cpu: 6400.0,
            mem: 0.0,
        };
        let delta = delta_badness(usage, unlimited, &policy, 5);
        assert!(delta.cpu < 0.0);
    }

    #[test]
    fn test_start_of_bad_tracking() {
        let policy = policy();
        let mut badness = Badness::new(0);
        let hot = PerAxis {
            cpu: 400.0,
            mem: 0.0,
        };
        badness.update(hot, QUOTAS, &policy, 5, 100);
        assert_eq!(badness.start_of_bad_ts, 100);

        // Stays put while bad
        badness.update(hot, QUOTAS, &policy, 5, 105);
        assert_eq!(badness.start_of_bad_ts, 100);
    }

    #[test]
    fn test_expired() {
        let badness = Badness::from_scores(5.0, 0.0, 1000);
        assert!(!badness.expired(3600, 2000));
        assert!(badness.expired(3600, 5000));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Scores stay inside [0, 100] per axis over any usage trace.
            #[test]
            fn badness_stays_bounded(
                trace in prop::collection::vec((0.0f64..8000.0, 0.0f64..200.0), 1..200)
            ) {
                let policy = policy();
                let mut badness = Badness::new(0);
                for (i, (cpu, mem)) in trace.into_iter().enumerate() {
                    let usage = PerAxis { cpu, mem };
                    badness.update(usage, QUOTAS, &policy, 5, (i as i64 + 1) * 5);
                    prop_assert!((0.0..=100.0).contains(&badness.cpu));
                    prop_assert!((0.0..=100.0).contains(&badness.mem));
                    prop_assert!(badness.score() <= 100.0);
                }
            }

            /// The violation check agrees with the combined score.
            #[test]
            fn violation_iff_score_saturated(
                cpu in 0.0f64..100.0,
                mem in 0.0f64..100.0,
            ) {
                let badness = Badness::from_scores(cpu, mem, 0);
                prop_assert_eq!(badness.is_violation(), cpu + mem >= 100.0);
            }
        }
    }
}
