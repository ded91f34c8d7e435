//! Autoscaler: stateful wrapper around [`decide`].
//!
//! Owns the policy state between polls, seeds the cooldown at test start,
//! and moves the cooldown stamp to the completion time of each action.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::policy::{
    PolicyState, ScaleAction, ScaleDirection, ScalingDecision, ScalingPolicy, TestMetricSample,
    decide,
};

pub struct Autoscaler {
    policy: ScalingPolicy,
    state: PolicyState,
    last_decision: Option<ScalingDecision>,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            state: PolicyState::default(),
            last_decision: None,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn state(&self) -> &PolicyState {
        &self.state
    }

    pub fn last_decision(&self) -> Option<&ScalingDecision> {
        self.last_decision.as_ref()
    }

    /// Mark the start of the measured test. When `counts_as_scale_out` is
    /// set, the start is treated as the last scale-out so the first one
    /// waits a full cooldown.
    pub fn start_test(&mut self, at: Instant, counts_as_scale_out: bool) {
        self.state = PolicyState::default();
        if counts_as_scale_out {
            self.state.cooldown.record(ScaleDirection::Out, at);
        }
        debug!(counts_as_scale_out, "autoscaler reset for test start");
    }

    /// Decide for one sample. A finished test never scales.
    pub fn evaluate(
        &mut self,
        sample: &TestMetricSample,
        instance_count: u32,
        now: Instant,
    ) -> ScalingDecision {
        if sample.finished {
            return ScalingDecision {
                action: ScaleAction::NoAction,
                at: now,
            };
        }

        let (decision, next) = decide(sample.rps, instance_count, &self.state, &self.policy, now);
        self.state = next;

        match decision.action {
            ScaleAction::NoAction => debug!(
                rps = sample.rps,
                instances = instance_count,
                since_last_change = ?sample.since_last_change,
                out_streak = self.state.scale_out_streak,
                in_streak = self.state.scale_in_streak,
                "no scaling action"
            ),
            ScaleAction::ScaleOut(n) => info!(
                rps = sample.rps,
                target = self.policy.rps_target,
                instances = instance_count,
                step = n,
                since_last_change = ?sample.since_last_change,
                "scaling out"
            ),
            ScaleAction::ScaleIn(n) => info!(
                rps = sample.rps,
                target = self.policy.rps_target,
                instances = instance_count,
                step = n,
                since_last_change = ?sample.since_last_change,
                "scaling in"
            ),
        }

        self.last_decision = Some(decision);
        decision
    }

    /// Stamp the cooldown for `direction` at the time the action finished.
    pub fn record_action(&mut self, direction: ScaleDirection, completed_at: Instant) {
        self.state.cooldown.record(direction, completed_at);
    }
}
