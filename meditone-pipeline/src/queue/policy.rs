//! Retry policies and backoff functions

use crate::models::Stage;
use std::collections::HashMap;
use std::time::Duration;

/// Backoff function `attempt → delay`
///
/// `attempt` is the 1-based number of the attempt that just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Fixed schedule in seconds; attempts past the end reuse the last entry
    Schedule(Vec<u64>),
    /// `min(base + step·(attempt−1), cap)` seconds
    Linear { base: u64, step: u64, cap: u64 },
}

/// Status poll re-enqueue delay: `min(10 + 10·(attempt−1), 30)`
pub const POLL_BACKOFF: Backoff = Backoff::Linear {
    base: 10,
    step: 10,
    cap: 30,
};

/// Lossless conversion check delay: `min(10 + 5·(try−1), 30)`
pub const CONVERSION_BACKOFF: Backoff = Backoff::Linear {
    base: 10,
    step: 5,
    cap: 30,
};

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1);
        let secs = match self {
            Backoff::Schedule(schedule) => schedule
                .get(index as usize)
                .or_else(|| schedule.last())
                .copied()
                .unwrap_or(0),
            Backoff::Linear { base, step, cap } => base
                .saturating_add(step.saturating_mul(u64::from(index)))
                .min(*cap),
        };
        Duration::from_secs(secs)
    }

    /// Zero delay for every attempt (tests and local runs)
    pub fn immediate() -> Self {
        Backoff::Schedule(vec![0])
    }
}

/// Per-stage retry declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// An in-flight attempt running longer than this counts as failed
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn for_stage(stage: Stage) -> Self {
        let timeout_secs = match stage {
            Stage::Script | Stage::Voice => 300,
            Stage::MusicKickoff => 120,
            Stage::MusicPoll | Stage::MusicStore => 600,
            Stage::Mix => 900,
        };

        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(timeout_secs),
            backoff: Backoff::Schedule(vec![10, 30, 60]),
        }
    }
}

/// Retry policies for every stage, plus the poll loop bound
#[derive(Debug, Clone)]
pub struct StagePolicies {
    policies: HashMap<Stage, RetryPolicy>,
    /// Maximum status polls before the music task counts as failed
    pub poll_limit: u32,
    pub poll_backoff: Backoff,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            policies: Stage::ALL
                .into_iter()
                .map(|stage| (stage, RetryPolicy::for_stage(stage)))
                .collect(),
            poll_limit: 50,
            poll_backoff: POLL_BACKOFF,
        }
    }
}

impl StagePolicies {
    pub fn get(&self, stage: Stage) -> RetryPolicy {
        self.policies
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| RetryPolicy::for_stage(stage))
    }

    /// Replace one stage's policy
    pub fn with_policy(mut self, stage: Stage, policy: RetryPolicy) -> Self {
        self.policies.insert(stage, policy);
        self
    }

    /// Apply the same backoff to every stage and the poll loop
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        for policy in self.policies.values_mut() {
            policy.backoff = backoff.clone();
        }
        self.poll_backoff = backoff;
        self
    }

    pub fn with_poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    /// Longest stage timeout; bounds how long any lease can be held
    pub fn max_timeout(&self) -> Duration {
        self.policies
            .values()
            .map(|policy| policy.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_backoff_formula() {
        for attempt in 1..=50u32 {
            let expected = (10 + 10 * (u64::from(attempt) - 1)).min(30);
            assert_eq!(POLL_BACKOFF.delay(attempt), Duration::from_secs(expected));
        }
        assert_eq!(POLL_BACKOFF.delay(1), Duration::from_secs(10));
        assert_eq!(POLL_BACKOFF.delay(2), Duration::from_secs(20));
        assert_eq!(POLL_BACKOFF.delay(3), Duration::from_secs(30));
        assert_eq!(POLL_BACKOFF.delay(7), Duration::from_secs(30));
    }

    #[test]
    fn test_conversion_backoff_formula() {
        let delays: Vec<u64> = (1..=6).map(|t| CONVERSION_BACKOFF.delay(t).as_secs()).collect();
        assert_eq!(delays, vec![10, 15, 20, 25, 30, 30]);
    }

    #[test]
    fn test_schedule_reuses_last_entry() {
        let backoff = Backoff::Schedule(vec![10, 30, 60]);
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::from_secs(60));
        assert_eq!(backoff.delay(9), Duration::from_secs(60));
        assert_eq!(Backoff::Schedule(vec![]).delay(1), Duration::ZERO);
    }

    #[test]
    fn test_stage_policy_table() {
        let policies = StagePolicies::default();
        assert_eq!(policies.get(Stage::Mix).timeout, Duration::from_secs(900));
        assert_eq!(policies.get(Stage::MusicKickoff).timeout, Duration::from_secs(120));
        assert_eq!(policies.get(Stage::Script).max_attempts, 3);
        assert_eq!(policies.poll_limit, 50);
        assert_eq!(policies.max_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn test_with_backoff_overrides_all() {
        let policies = StagePolicies::default().with_backoff(Backoff::immediate());
        for stage in Stage::ALL {
            assert_eq!(policies.get(stage).backoff.delay(2), Duration::ZERO);
        }
        assert_eq!(policies.poll_backoff.delay(5), Duration::ZERO);
    }
}
