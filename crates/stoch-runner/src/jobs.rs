use std::collections::VecDeque;
use std::fmt;

use crate::{PolicyId, ScenarioId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Job {
    pub scenario_id: ScenarioId,
    pub policy_id: PolicyId,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scen_{}_pol_{}", self.scenario_id, self.policy_id)
    }
}

/// One-pass FIFO of every (scenario, policy) pair. Jobs are only ever
/// removed, never re-queued.
#[derive(Debug, Clone, Default)]
pub struct JobBacklog {
    queue: VecDeque<Job>,
    total: usize,
}

impl JobBacklog {
    /// Scenario-major, policy-minor.
    pub fn build(scenarios: &[ScenarioId], policies: &[PolicyId]) -> Self {
        let mut queue = VecDeque::with_capacity(scenarios.len() * policies.len());
        for &scenario_id in scenarios {
            for &policy_id in policies {
                queue.push_back(Job {
                    scenario_id,
                    policy_id,
                });
            }
        }
        let total = queue.len();
        Self { queue, total }
    }

    pub fn pop_next(&mut self) -> Option<Job> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Jobs not yet dispatched.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Jobs created at build time.
    pub fn total(&self) -> usize {
        self.total
    }
}
